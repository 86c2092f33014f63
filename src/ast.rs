//! Abstract syntax tree for aggregate data expressions
//!
//! The tree is a closed set of tagged variants. Scope functions are parsed
//! into dedicated nodes with their shift/selector specs already resolved, so
//! the evaluator never re-validates argument shapes at runtime. Reference
//! nodes keep the raw source text they were parsed from; the description
//! mode substitutes display names by that literal text.

use serde::{Deserialize, Serialize};

/// An expression tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Numeric literal
    Number(f64),

    /// String literal
    Text(String),

    /// Boolean literal
    Boolean(bool),

    /// The `[days]` scalar supplied by the caller
    Days,

    /// Dimensional data item reference, e.g. `#{fbfJHSPpUQD}` or `A{cejWyOfXge6}`
    DataItem { item: DimensionItem, raw: String },

    /// Constant reference, e.g. `C{gQNFkFkObU8}`
    Constant { uid: String, raw: String },

    /// Organisation-unit group count reference, e.g. `OUG{CXw2yu5fodb}`
    OrgUnitCount { uid: String, raw: String },

    /// Unary operator application
    Unary {
        op: UnaryOperator,
        operand: Box<Expr>,
    },

    /// Binary operator application
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Conditional or aggregation function call
    Function { func: FunctionKind, args: Vec<Expr> },

    /// `PERIOD(...)` shift or fan-out over the current period
    PeriodScope { spec: PeriodSpec, body: Box<Expr> },

    /// `OU_*(...)` rebinding or fan-out over the current organisation unit
    OrgScope { selector: OrgSelector, body: Box<Expr> },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}

impl BinaryOperator {
    /// Source form, used in error messages
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Power => "^",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "<>",
            BinaryOperator::Less => "<",
            BinaryOperator::LessEqual => "<=",
            BinaryOperator::Greater => ">",
            BinaryOperator::GreaterEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Negate,
    Not,
}

/// Conditional and aggregation functions
///
/// Scope functions are not listed here; they parse into the dedicated
/// `PeriodScope`/`OrgScope` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionKind {
    // Conditionals
    If,
    Coalesce,
    Except,
    IsNull,

    // Aggregations
    Sum,
    Min,
    Max,
    Average,
    Stddev,
    Variance,
    Median,
    Percentile,
    Count,
    First,
    Last,
    RankHigh,
    RankLow,
    RankPercentile,
}

impl FunctionKind {
    /// Canonical upper-case name, used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::If => "IF",
            FunctionKind::Coalesce => "COALESCE",
            FunctionKind::Except => "EXCEPT",
            FunctionKind::IsNull => "IS_NULL",
            FunctionKind::Sum => "SUM",
            FunctionKind::Min => "MIN",
            FunctionKind::Max => "MAX",
            FunctionKind::Average => "AVERAGE",
            FunctionKind::Stddev => "STDDEV",
            FunctionKind::Variance => "VARIANCE",
            FunctionKind::Median => "MEDIAN",
            FunctionKind::Percentile => "PERCENTILE",
            FunctionKind::Count => "COUNT",
            FunctionKind::First => "FIRST",
            FunctionKind::Last => "LAST",
            FunctionKind::RankHigh => "RANK_HIGH",
            FunctionKind::RankLow => "RANK_LOW",
            FunctionKind::RankPercentile => "RANK_PERCENTILE",
        }
    }

    /// True for the functions that reduce a value container
    pub fn is_aggregation(&self) -> bool {
        !matches!(
            self,
            FunctionKind::If | FunctionKind::Coalesce | FunctionKind::Except | FunctionKind::IsNull
        )
    }
}

/// Kind discriminator of a dimensional item reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionItemKind {
    DataElement,
    DataElementOperand,
    Attribute,
    Indicator,
    ReportingRate,
}

impl DimensionItemKind {
    /// The reference prefix in expression source
    pub fn prefix(&self) -> &'static str {
        match self {
            DimensionItemKind::DataElement | DimensionItemKind::DataElementOperand => "#",
            DimensionItemKind::Attribute => "A",
            DimensionItemKind::Indicator => "I",
            DimensionItemKind::ReportingRate => "R",
        }
    }
}

/// Opaque reference to an external data source, resolved by the value table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionItem {
    pub kind: DimensionItemKind,
    /// Identifier string; for operands this is `uid.categoryOptionComboUid`
    pub id: String,
}

impl DimensionItem {
    pub fn new(kind: DimensionItemKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DimensionItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{{}}}", self.kind.prefix(), self.id)
    }
}

/// Resolved shift specification of a `PERIOD(...)` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeriodSpec {
    /// One spec: shift in place, no fan-out
    Single(i32),
    /// Two or more specs, grouped into windows of four at parse time
    Windows(Vec<PeriodWindow>),
}

/// One fan-out window: year-shift range crossed with period-shift range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub period_from: i32,
    pub period_to: i32,
    pub year_from: i32,
    pub year_to: i32,
}

/// Resolved candidate selector of an `OU_*(...)` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrgSelector {
    /// Walk up at most `steps` parent links; rebinds, never fans out
    Ancestor { steps: u32 },
    /// Units exactly `depth` levels below the current unit, per listed depth
    Descendant { depths: Vec<u32> },
    /// Units at the given absolute levels within the current unit's subtree
    Level { levels: Vec<u32> },
    /// Units at the current unit's level under the ancestor `distance` up
    Peer { distance: u32 },
    /// Members of the named organisation-unit groups
    Group { names: Vec<String> },
    /// Units reporting the named datasets
    DataSet { names: Vec<String> },
}

impl OrgSelector {
    /// Source-level function name, used in error messages
    pub fn function_name(&self) -> &'static str {
        match self {
            OrgSelector::Ancestor { .. } => "OU_ANCESTOR",
            OrgSelector::Descendant { .. } => "OU_DESCENDANT",
            OrgSelector::Level { .. } => "OU_LEVEL",
            OrgSelector::Peer { .. } => "OU_PEER",
            OrgSelector::Group { .. } => "OU_GROUP",
            OrgSelector::DataSet { .. } => "OU_DATA_SET",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dimension_item_display() {
        let item = DimensionItem::new(DimensionItemKind::DataElement, "fbfJHSPpUQD");
        assert_eq!(item.to_string(), "#{fbfJHSPpUQD}");

        let operand = DimensionItem::new(DimensionItemKind::DataElementOperand, "fbf.pq2X");
        assert_eq!(operand.to_string(), "#{fbf.pq2X}");

        let attr = DimensionItem::new(DimensionItemKind::Attribute, "cejWyOfXge6");
        assert_eq!(attr.to_string(), "A{cejWyOfXge6}");
    }

    #[test]
    fn test_function_kind_classification() {
        assert!(FunctionKind::Sum.is_aggregation());
        assert!(FunctionKind::First.is_aggregation());
        assert!(FunctionKind::RankPercentile.is_aggregation());
        assert!(!FunctionKind::If.is_aggregation());
        assert!(!FunctionKind::Coalesce.is_aggregation());
    }

    #[test]
    fn test_expr_construction() {
        let expr = Expr::Binary {
            op: BinaryOperator::Add,
            left: Box::new(Expr::Number(1.0)),
            right: Box::new(Expr::Number(2.0)),
        };

        if let Expr::Binary { op, .. } = expr {
            assert_eq!(op.symbol(), "+");
        } else {
            panic!("expected binary node");
        }
    }

    #[test]
    fn test_ast_serde_round_trip() {
        let expr = Expr::PeriodScope {
            spec: PeriodSpec::Windows(vec![PeriodWindow {
                period_from: -3,
                period_to: -1,
                year_from: 0,
                year_to: 0,
            }]),
            body: Box::new(Expr::DataItem {
                item: DimensionItem::new(DimensionItemKind::DataElement, "fbfJHSPpUQD"),
                raw: "#{fbfJHSPpUQD}".to_string(),
            }),
        };

        let json = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }
}
