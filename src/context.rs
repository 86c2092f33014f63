//! Evaluation coordinates and the data keys derived from them
//!
//! `EvalContext` carries the current organisation unit, period, aggregation
//! hint, and the lookup tables an evaluation draws on. It is immutable:
//! scope functions derive a child context with `with_*` and pass it down,
//! so no state ever has to be restored on the way back up.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::DimensionItem;

/// An ISO period identifier such as `202407`, `2024Q3`, or `2024`.
///
/// Periods of one granularity order correctly as strings, which is what
/// first/last selection relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period(pub String);

impl Period {
    pub fn new(iso: impl Into<String>) -> Self {
        Period(iso.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An organisation unit identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrgUnit(pub String);

impl OrgUnit {
    pub fn new(uid: impl Into<String>) -> Self {
        OrgUnit(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrgUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregation hint an enclosing aggregation function attaches to the data
/// references below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Sum,
    Average,
    Min,
    Max,
    Count,
    Stddev,
    Variance,
    Median,
    First,
    Last,
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationType::Sum => "sum",
            AggregationType::Average => "average",
            AggregationType::Min => "min",
            AggregationType::Max => "max",
            AggregationType::Count => "count",
            AggregationType::Stddev => "stddev",
            AggregationType::Variance => "variance",
            AggregationType::Median => "median",
            AggregationType::First => "first",
            AggregationType::Last => "last",
        };
        write!(f, "{}", name)
    }
}

/// One data dependency: which item is needed, where, when, and under which
/// aggregation hint.
///
/// Discovery emits these; evaluation uses the same tuple as the key into the
/// caller's value table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpressionItem {
    pub org_unit: OrgUnit,
    pub period: Period,
    pub item: DimensionItem,
    pub aggregation: Option<AggregationType>,
}

impl fmt::Display for ExpressionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_unit, self.period, self.item)?;
        if let Some(aggregation) = &self.aggregation {
            write!(f, "/{}", aggregation)?;
        }
        Ok(())
    }
}

/// Live measurements keyed by the full dependency tuple
pub type ValueMap = HashMap<ExpressionItem, f64>;

/// The coordinates one tree walk runs under.
///
/// The tables are shared via `Arc` so deriving a child context is a cheap
/// clone. `filtering` is true while an organisation-unit scope has already
/// fanned out, which turns nested scopes into membership filters.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub org_unit: Option<OrgUnit>,
    pub period: Option<Period>,
    pub aggregation: Option<AggregationType>,
    pub constants: Arc<HashMap<String, f64>>,
    pub org_unit_counts: Arc<HashMap<String, f64>>,
    pub days: Option<f64>,
    pub filtering: bool,
}

impl EvalContext {
    /// A context with nothing bound, as used by syntax checking
    pub fn unbound() -> Self {
        EvalContext {
            org_unit: None,
            period: None,
            aggregation: None,
            constants: Arc::new(HashMap::new()),
            org_unit_counts: Arc::new(HashMap::new()),
            days: None,
            filtering: false,
        }
    }

    pub fn new(org_unit: OrgUnit, period: Period) -> Self {
        EvalContext {
            org_unit: Some(org_unit),
            period: Some(period),
            ..EvalContext::unbound()
        }
    }

    pub fn with_constants(mut self, constants: HashMap<String, f64>) -> Self {
        self.constants = Arc::new(constants);
        self
    }

    pub fn with_org_unit_counts(mut self, counts: HashMap<String, f64>) -> Self {
        self.org_unit_counts = Arc::new(counts);
        self
    }

    pub fn with_days(mut self, days: f64) -> Self {
        self.days = Some(days);
        self
    }

    /// Derive a context positioned at another period
    pub fn at_period(&self, period: Period) -> Self {
        let mut child = self.clone();
        child.period = Some(period);
        child
    }

    /// Derive a context positioned at another organisation unit
    pub fn at_org_unit(&self, org_unit: OrgUnit) -> Self {
        let mut child = self.clone();
        child.org_unit = Some(org_unit);
        child
    }

    /// Derive a context with the filtering flag set
    pub fn filtering(&self) -> Self {
        let mut child = self.clone();
        child.filtering = true;
        child
    }

    /// Derive a context carrying an aggregation hint for nested references
    pub fn with_aggregation(&self, aggregation: Option<AggregationType>) -> Self {
        let mut child = self.clone();
        child.aggregation = aggregation;
        child
    }
}
