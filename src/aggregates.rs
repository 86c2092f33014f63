//! Statistical reducers applied by the aggregation functions
//!
//! The statistical reducers take the non-null numeric entries of a value
//! container and return `None` for inputs they are undefined on. An empty
//! input is never an error and never coerced to zero. The rank functions
//! instead take the collected sequence with its null slots: a missing entry
//! never matches a comparison, but it still counts toward the sequence
//! length and keeps the sequence non-empty.

/// Sum; `None` when empty
pub fn sum(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum())
}

pub fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

pub fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n - 1 denominator); needs at least two values
pub fn variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some(sum_sq / (values.len() - 1) as f64)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    variance(values).map(f64::sqrt)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Percentile with linear interpolation between closest ranks
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let sorted = sorted(values);
    let rank = (sorted.len() - 1) as f64 * p / 100.0;
    let lower = rank.floor() as usize;
    let fraction = rank - lower as f64;
    let value = if lower + 1 < sorted.len() {
        sorted[lower] + fraction * (sorted[lower + 1] - sorted[lower])
    } else {
        sorted[lower]
    };
    Some(value)
}

/// Number of values less than or equal to the test value
pub fn rank_high(values: &[Option<f64>], test: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().flatten().filter(|v| **v <= test).count() as f64)
}

/// One-based rank from the top: values strictly greater, plus one
pub fn rank_low(values: &[Option<f64>], test: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().flatten().filter(|v| **v > test).count() as f64 + 1.0)
}

/// `rank_high` scaled to the full sequence length, rounded to an integer
pub fn rank_percentile(values: &[Option<f64>], test: f64) -> Option<f64> {
    let rank = rank_high(values, test)?;
    Some((100.0 * rank / values.len() as f64).round())
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}
