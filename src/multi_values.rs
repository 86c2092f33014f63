//! Ordered collection of scalar results produced by scope fan-out
//!
//! A container either tags every entry with the period that produced it or
//! tags none of them. The tagged form is what period fan-out builds and what
//! FIRST/LAST consume; the plain form is what organisation-unit fan-out
//! builds and what the statistical reducers consume. The all-or-nothing
//! tagging rule is enforced on every mutation, so a container handed to a
//! caller is always well formed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::Period;
use crate::error::{ExpressionError, Result};
use crate::value::Value;

/// Entries are scalar results; a `None` entry is a missing measurement that
/// was sampled anyway (period fan-out keeps the slot, unit fan-out drops it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiValues {
    values: Vec<Option<Value>>,
    periods: Option<Vec<Period>>,
}

impl MultiValues {
    pub fn new() -> Self {
        MultiValues::default()
    }

    /// Build an untagged container from a list of entries
    pub fn plain(values: Vec<Option<Value>>) -> Self {
        MultiValues {
            values,
            periods: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn has_periods(&self) -> bool {
        self.periods.is_some()
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    /// Consume the collection, dropping any period tags
    pub fn into_values(self) -> Vec<Option<Value>> {
        self.values
    }

    pub fn periods(&self) -> Option<&[Period]> {
        self.periods.as_deref()
    }

    /// Append an entry, splicing containers element-wise.
    ///
    /// Splicing a tagged container carries its period tags over; anything
    /// else appends plain. Combining tagged and plain entries in one
    /// container is rejected.
    pub fn add_value(&mut self, value: Option<Value>) -> Result<()> {
        match value {
            Some(Value::Multi(other)) => match other.periods {
                Some(other_periods) => {
                    if self.periods.is_none() && !self.values.is_empty() {
                        return Err(mixed_tagging());
                    }
                    self.periods
                        .get_or_insert_with(Vec::new)
                        .extend(other_periods);
                    self.values.extend(other.values);
                    Ok(())
                }
                None => {
                    if self.has_periods() {
                        return Err(mixed_tagging());
                    }
                    self.values.extend(other.values);
                    Ok(())
                }
            },
            entry => {
                if self.has_periods() {
                    return Err(mixed_tagging());
                }
                self.values.push(entry);
                Ok(())
            }
        }
    }

    /// Append an entry tagged with the period that produced it.
    ///
    /// A plain container unrolls element-wise under the given period. A
    /// tagged container is the output of another period fan-out and cannot
    /// be re-tagged.
    pub fn add_period_value(&mut self, period: Period, value: Option<Value>) -> Result<()> {
        if self.periods.is_none() && !self.values.is_empty() {
            return Err(mixed_tagging());
        }
        match value {
            Some(Value::Multi(other)) => {
                if other.has_periods() {
                    return Err(ExpressionError::InvalidComposition(
                        "cannot chain two period functions with no aggregation between".to_string(),
                    ));
                }
                let periods = self.periods.get_or_insert_with(Vec::new);
                for entry in other.values {
                    periods.push(period.clone());
                    self.values.push(entry);
                }
                Ok(())
            }
            entry => {
                self.periods.get_or_insert_with(Vec::new).push(period);
                self.values.push(entry);
                Ok(())
            }
        }
    }

    /// Select entries from the earliest (ascending) or latest periods.
    ///
    /// Entries are grouped by period, groups are visited in period order,
    /// and within a group entries keep their insertion order. Selection
    /// stops once `limit` entries are collected. The result is plain, so an
    /// enclosing period fan-out can splice it.
    pub fn first_or_last(&self, limit: usize, ascending: bool) -> Result<MultiValues> {
        let periods = self.periods.as_ref().ok_or_else(|| {
            ExpressionError::InvalidComposition(
                "multiple period values expected, found values without periods".to_string(),
            )
        })?;

        let mut grouped: BTreeMap<&Period, Vec<&Option<Value>>> = BTreeMap::new();
        for (period, value) in periods.iter().zip(self.values.iter()) {
            grouped.entry(period).or_default().push(value);
        }

        let mut selected = MultiValues::new();
        let groups: Box<dyn Iterator<Item = (&&Period, &Vec<&Option<Value>>)>> = if ascending {
            Box::new(grouped.iter())
        } else {
            Box::new(grouped.iter().rev())
        };
        'outer: for (_, group) in groups {
            for value in group {
                if selected.len() >= limit {
                    break 'outer;
                }
                selected.values.push((*value).clone());
            }
        }

        Ok(selected)
    }
}

fn mixed_tagging() -> ExpressionError {
    ExpressionError::InvalidComposition(
        "cannot combine period-tagged and plain values in one collection".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn num(n: f64) -> Option<Value> {
        Some(Value::Number(n))
    }

    #[test]
    fn test_plain_append_and_splice() {
        let mut container = MultiValues::new();
        container.add_value(num(1.0)).unwrap();
        container.add_value(None).unwrap();

        let mut inner = MultiValues::new();
        inner.add_value(num(2.0)).unwrap();
        inner.add_value(num(3.0)).unwrap();
        container.add_value(Some(Value::Multi(inner))).unwrap();

        assert_eq!(container.len(), 4);
        assert!(!container.has_periods());
        assert_eq!(container.values()[3], num(3.0));
    }

    #[test]
    fn test_splicing_tagged_container_carries_periods() {
        let mut tagged = MultiValues::new();
        tagged.add_period_value(Period::new("202401"), num(1.0)).unwrap();
        tagged.add_period_value(Period::new("202402"), num(2.0)).unwrap();

        let mut outer = MultiValues::new();
        outer.add_value(Some(Value::Multi(tagged))).unwrap();

        assert!(outer.has_periods());
        assert_eq!(outer.len(), 2);
        assert_eq!(
            outer.periods().unwrap(),
            &[Period::new("202401"), Period::new("202402")]
        );
    }

    #[test]
    fn test_mixed_tagging_rejected() {
        let mut tagged = MultiValues::new();
        tagged.add_period_value(Period::new("202401"), num(1.0)).unwrap();
        assert!(tagged.add_value(num(2.0)).is_err());

        let mut plain = MultiValues::plain(vec![num(1.0)]);
        assert!(plain
            .add_period_value(Period::new("202401"), num(2.0))
            .is_err());
    }

    #[test]
    fn test_period_splice_unrolls_plain_container() {
        let inner = MultiValues::plain(vec![num(5.0), num(6.0)]);
        let mut outer = MultiValues::new();
        outer
            .add_period_value(Period::new("202403"), Some(Value::Multi(inner)))
            .unwrap();

        assert_eq!(outer.len(), 2);
        assert_eq!(
            outer.periods().unwrap(),
            &[Period::new("202403"), Period::new("202403")]
        );
    }

    #[test]
    fn test_period_splice_of_tagged_container_is_rejected() {
        let mut inner = MultiValues::new();
        inner.add_period_value(Period::new("202401"), num(1.0)).unwrap();

        let mut outer = MultiValues::new();
        let err = outer
            .add_period_value(Period::new("202402"), Some(Value::Multi(inner)))
            .unwrap_err();
        assert!(err.to_string().contains("chain two period functions"));
    }

    #[test]
    fn test_first_and_last_selection() {
        let mut container = MultiValues::new();
        // Inserted out of period order on purpose
        container.add_period_value(Period::new("202402"), num(20.0)).unwrap();
        container.add_period_value(Period::new("202401"), num(10.0)).unwrap();
        container.add_period_value(Period::new("202403"), num(30.0)).unwrap();

        let first = container.first_or_last(1, true).unwrap();
        assert_eq!(first.values(), &[num(10.0)]);
        assert!(!first.has_periods());

        let last_two = container.first_or_last(2, false).unwrap();
        assert_eq!(last_two.values(), &[num(30.0), num(20.0)]);
    }

    #[test]
    fn test_selection_keeps_insertion_order_within_a_period() {
        let mut container = MultiValues::new();
        container.add_period_value(Period::new("202401"), num(1.0)).unwrap();
        container.add_period_value(Period::new("202401"), num(2.0)).unwrap();
        container.add_period_value(Period::new("202402"), num(3.0)).unwrap();

        let selected = container.first_or_last(2, true).unwrap();
        assert_eq!(selected.values(), &[num(1.0), num(2.0)]);
    }

    #[test]
    fn test_selection_requires_period_tags() {
        let container = MultiValues::plain(vec![num(1.0)]);
        let err = container.first_or_last(1, true).unwrap_err();
        assert!(err.to_string().contains("period values expected"));
    }
}
