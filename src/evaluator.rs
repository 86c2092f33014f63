//! Tree-walking evaluator shared by all evaluation modes
//!
//! One dispatch core serves three modes. Evaluate computes a value against
//! live data and short-circuits branching constructs. Discover walks every
//! branch, emits the data dependencies it passes, and feeds placeholder
//! values onward so the walk never stalls. Describe walks like Discover but
//! records display names for later substitution into the source text.
//! Syntax checking is Discover run under an unbound context.

use std::collections::{HashMap, HashSet};

use crate::aggregates;
use crate::ast::{BinaryOperator, Expr, FunctionKind, UnaryOperator};
use crate::context::{AggregationType, EvalContext, ExpressionItem, ValueMap};
use crate::error::{ExpressionError, Result};
use crate::providers::{MetadataResolver, OrgUnitLocator, PeriodEngine};
use crate::scope;
use crate::value::Value;

/// Stands in for a data value in the modes that run without data
pub(crate) const PLACEHOLDER: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Compute a value from live data, short-circuiting branches
    Evaluate,
    /// Collect every data dependency, visiting all branches
    Discover,
    /// Record display names for description rendering
    Describe,
}

/// One tree walk in one mode.
///
/// The walker borrows its collaborators and accumulates discovered items and
/// display names. A fresh instance is built per top-level call.
pub struct Evaluator<'a> {
    pub(crate) mode: EvalMode,
    pub(crate) values: &'a ValueMap,
    pub(crate) periods: &'a dyn PeriodEngine,
    pub(crate) org_units: &'a dyn OrgUnitLocator,
    pub(crate) metadata: &'a dyn MetadataResolver,
    pub(crate) items: HashSet<ExpressionItem>,
    pub(crate) names: HashMap<String, String>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        mode: EvalMode,
        values: &'a ValueMap,
        periods: &'a dyn PeriodEngine,
        org_units: &'a dyn OrgUnitLocator,
        metadata: &'a dyn MetadataResolver,
    ) -> Self {
        Evaluator {
            mode,
            values,
            periods,
            org_units,
            metadata,
            items: HashSet::new(),
            names: HashMap::new(),
        }
    }

    /// Data dependencies collected by a Discover walk
    pub fn into_items(self) -> HashSet<ExpressionItem> {
        self.items
    }

    /// Reference text -> display name pairs collected by a Describe walk
    pub fn names(&self) -> &HashMap<String, String> {
        &self.names
    }

    /// Evaluate one node under the given coordinates
    pub fn evaluate(&mut self, expr: &Expr, context: &EvalContext) -> Result<Option<Value>> {
        match expr {
            Expr::Number(n) => Ok(Some(Value::Number(*n))),
            Expr::Text(s) => Ok(Some(Value::Text(s.clone()))),
            Expr::Boolean(b) => Ok(Some(Value::Boolean(*b))),

            Expr::Days => match self.mode {
                EvalMode::Evaluate => Ok(context.days.map(Value::Number)),
                // Placeholder modes proceed numerically without bound days
                _ => Ok(Some(Value::Number(context.days.unwrap_or(PLACEHOLDER)))),
            },

            Expr::DataItem { item, raw } => self.data_item(item, raw, context),
            Expr::Constant { uid, raw } => self.constant(uid, raw, context),
            Expr::OrgUnitCount { uid, raw } => self.org_unit_count(uid, raw, context),

            Expr::Unary { op, operand } => {
                let value = self.evaluate(operand, context)?;
                match op {
                    UnaryOperator::Negate => {
                        Ok(Value::as_number(value.as_ref())?.map(|n| Value::Number(-n)))
                    }
                    UnaryOperator::Not => {
                        Ok(Value::as_boolean(value.as_ref())?.map(|b| Value::Boolean(!b)))
                    }
                }
            }

            Expr::Binary { op, left, right } => self.binary(*op, left, right, context),

            Expr::Function { func, args } => self.function(*func, args, context),

            Expr::PeriodScope { spec, body } => scope::period_scope(self, spec, body, context),
            Expr::OrgScope { selector, body } => scope::org_scope(self, selector, body, context),
        }
    }

    fn data_item(
        &mut self,
        item: &crate::ast::DimensionItem,
        raw: &str,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        match self.mode {
            EvalMode::Evaluate => {
                let (Some(org_unit), Some(period)) = (&context.org_unit, &context.period) else {
                    return Err(ExpressionError::Internal(
                        "evaluation reached a data item with no organisation unit or period bound"
                            .to_string(),
                    ));
                };
                let key = ExpressionItem {
                    org_unit: org_unit.clone(),
                    period: period.clone(),
                    item: item.clone(),
                    aggregation: context.aggregation,
                };
                // A missing measurement is null, not an error
                Ok(self.values.get(&key).map(|v| Value::Number(*v)))
            }
            EvalMode::Discover => {
                if let (Some(org_unit), Some(period)) = (&context.org_unit, &context.period) {
                    self.items.insert(ExpressionItem {
                        org_unit: org_unit.clone(),
                        period: period.clone(),
                        item: item.clone(),
                        aggregation: context.aggregation,
                    });
                }
                Ok(Some(Value::Number(PLACEHOLDER)))
            }
            EvalMode::Describe => {
                let name = self.metadata.data_item_name(item).ok_or_else(|| {
                    ExpressionError::UnresolvedReference(format!("data item not found: {}", raw))
                })?;
                self.names.insert(raw.to_string(), name);
                Ok(Some(Value::Number(PLACEHOLDER)))
            }
        }
    }

    fn constant(&mut self, uid: &str, raw: &str, context: &EvalContext) -> Result<Option<Value>> {
        let value = context.constants.get(uid).copied();
        match self.mode {
            EvalMode::Evaluate => {
                let value = value.ok_or_else(|| {
                    ExpressionError::UnresolvedReference(format!("constant not found: {}", raw))
                })?;
                Ok(Some(Value::Number(value)))
            }
            EvalMode::Discover => Ok(Some(Value::Number(value.unwrap_or(PLACEHOLDER)))),
            EvalMode::Describe => {
                let name = self.metadata.constant_name(uid).ok_or_else(|| {
                    ExpressionError::UnresolvedReference(format!("constant not found: {}", raw))
                })?;
                self.names.insert(raw.to_string(), name);
                Ok(Some(Value::Number(value.unwrap_or(PLACEHOLDER))))
            }
        }
    }

    fn org_unit_count(
        &mut self,
        uid: &str,
        raw: &str,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let count = context.org_unit_counts.get(uid).copied();
        match self.mode {
            // The count table is data, so a missing entry reads as null
            EvalMode::Evaluate => Ok(count.map(Value::Number)),
            EvalMode::Discover => Ok(Some(Value::Number(count.unwrap_or(PLACEHOLDER)))),
            EvalMode::Describe => {
                let group = self.metadata.find_org_unit_group(uid).ok_or_else(|| {
                    ExpressionError::UnresolvedReference(format!(
                        "organisation unit group not found: {}",
                        raw
                    ))
                })?;
                self.names.insert(raw.to_string(), group.name);
                Ok(Some(Value::Number(count.unwrap_or(PLACEHOLDER))))
            }
        }
    }

    fn binary(
        &mut self,
        op: BinaryOperator,
        left: &Expr,
        right: &Expr,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        match op {
            BinaryOperator::And => self.logical_and(left, right, context),
            BinaryOperator::Or => self.logical_or(left, right, context),

            BinaryOperator::Equal
            | BinaryOperator::NotEqual
            | BinaryOperator::Less
            | BinaryOperator::LessEqual
            | BinaryOperator::Greater
            | BinaryOperator::GreaterEqual => {
                let left = self.evaluate(left, context)?;
                let right = self.evaluate(right, context)?;
                let ordering = Value::compare(left.as_ref(), right.as_ref())?;
                Ok(ordering.map(|ordering| {
                    let holds = match op {
                        BinaryOperator::Equal => ordering.is_eq(),
                        BinaryOperator::NotEqual => ordering.is_ne(),
                        BinaryOperator::Less => ordering.is_lt(),
                        BinaryOperator::LessEqual => ordering.is_le(),
                        BinaryOperator::Greater => ordering.is_gt(),
                        BinaryOperator::GreaterEqual => ordering.is_ge(),
                        _ => unreachable!("non-comparison operator in comparison arm"),
                    };
                    Value::Boolean(holds)
                }))
            }

            BinaryOperator::Add => {
                let left = self.evaluate(left, context)?;
                let right = self.evaluate(right, context)?;
                add(left, right)
            }

            BinaryOperator::Subtract
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo
            | BinaryOperator::Power => {
                let left = Value::as_number(self.evaluate(left, context)?.as_ref())?;
                let right = Value::as_number(self.evaluate(right, context)?.as_ref())?;
                let (Some(left), Some(right)) = (left, right) else {
                    return Ok(None);
                };
                // Division and modulo by zero follow IEEE 754
                let result = match op {
                    BinaryOperator::Subtract => left - right,
                    BinaryOperator::Multiply => left * right,
                    BinaryOperator::Divide => left / right,
                    BinaryOperator::Modulo => left % right,
                    BinaryOperator::Power => left.powf(right),
                    _ => unreachable!("non-arithmetic operator in arithmetic arm"),
                };
                Ok(Some(Value::Number(result)))
            }
        }
    }

    /// Only a false left side short-circuits; a null on either side makes
    /// the result null once the other side is known not to decide it
    fn logical_and(
        &mut self,
        left: &Expr,
        right: &Expr,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let left = Value::as_boolean(self.evaluate(left, context)?.as_ref())?;
        if left == Some(false) && self.mode == EvalMode::Evaluate {
            return Ok(Some(Value::Boolean(false)));
        }
        let right = Value::as_boolean(self.evaluate(right, context)?.as_ref())?;
        Ok(match (left, right) {
            (Some(false), _) => Some(Value::Boolean(false)),
            (None, _) | (_, None) => None,
            (Some(true), Some(right)) => Some(Value::Boolean(right)),
        })
    }

    fn logical_or(
        &mut self,
        left: &Expr,
        right: &Expr,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let left = Value::as_boolean(self.evaluate(left, context)?.as_ref())?;
        if left == Some(true) && self.mode == EvalMode::Evaluate {
            return Ok(Some(Value::Boolean(true)));
        }
        let right = Value::as_boolean(self.evaluate(right, context)?.as_ref())?;
        Ok(match (left, right) {
            (Some(true), _) => Some(Value::Boolean(true)),
            (None, _) | (_, None) => None,
            (Some(false), Some(right)) => Some(Value::Boolean(right)),
        })
    }

    fn function(
        &mut self,
        func: FunctionKind,
        args: &[Expr],
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        match func {
            FunctionKind::If => {
                let condition = Value::as_boolean(self.evaluate(&args[0], context)?.as_ref())?;
                if self.mode == EvalMode::Evaluate {
                    return match condition {
                        Some(true) => self.evaluate(&args[1], context),
                        Some(false) => self.evaluate(&args[2], context),
                        None => Ok(None),
                    };
                }
                let then_value = self.evaluate(&args[1], context)?;
                let else_value = self.evaluate(&args[2], context)?;
                Ok(match condition {
                    Some(true) => then_value,
                    Some(false) => else_value,
                    None => None,
                })
            }

            FunctionKind::Coalesce => {
                let mut found = None;
                for arg in args {
                    let value = self.evaluate(arg, context)?;
                    if found.is_none() && value.is_some() {
                        found = value;
                        if self.mode == EvalMode::Evaluate {
                            break;
                        }
                    }
                }
                Ok(found)
            }

            FunctionKind::Except => {
                let condition = Value::as_boolean(self.evaluate(&args[0], context)?.as_ref())?;
                if condition == Some(true) && self.mode == EvalMode::Evaluate {
                    return Ok(None);
                }
                let value = self.evaluate(&args[1], context)?;
                Ok(if condition == Some(true) { None } else { value })
            }

            FunctionKind::IsNull => {
                let value = self.evaluate(&args[0], context)?;
                Ok(Some(Value::Boolean(value.is_none())))
            }

            FunctionKind::First | FunctionKind::Last => {
                self.first_or_last(func == FunctionKind::First, args, context)
            }

            _ => self.aggregation(func, args, context),
        }
    }

    fn first_or_last(
        &mut self,
        ascending: bool,
        args: &[Expr],
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let hint = if ascending {
            AggregationType::First
        } else {
            AggregationType::Last
        };
        let inner = context.with_aggregation(Some(hint));
        let value = self.evaluate(&args[0], &inner)?;

        let limit = match args.get(1) {
            Some(arg) => {
                let Some(limit) = Value::as_number(self.evaluate(arg, context)?.as_ref())? else {
                    return Ok(None);
                };
                if limit < 0.0 || limit.fract() != 0.0 {
                    return Err(ExpressionError::Type(format!(
                        "selection limit must be a non-negative integer, found {}",
                        limit
                    )));
                }
                Some(limit as usize)
            }
            None => None,
        };

        let container = match value {
            Some(Value::Multi(container)) => container,
            other => {
                if self.mode == EvalMode::Evaluate {
                    return Err(ExpressionError::InvalidComposition(
                        "multiple period values expected; apply FIRST/LAST to a PERIOD sub-expression"
                            .to_string(),
                    ));
                }
                // Unbound scopes degrade to a single visit, so pass through
                return Ok(other);
            }
        };

        let selected = container.first_or_last(limit.unwrap_or(1), ascending)?;
        match limit {
            // The plain form yields the single selected value
            None => Ok(selected.into_values().into_iter().next().flatten()),
            Some(_) => Ok(Some(Value::Multi(selected))),
        }
    }

    fn aggregation(
        &mut self,
        func: FunctionKind,
        args: &[Expr],
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        // Rank and percentile tests keep whatever hint encloses them
        let inner = match aggregation_hint(func) {
            Some(hint) => context.with_aggregation(Some(hint)),
            None => context.clone(),
        };
        let value = self.evaluate(&args[0], &inner)?;
        let test = match args.get(1) {
            Some(arg) => Value::as_number(self.evaluate(arg, context)?.as_ref())?,
            None => None,
        };

        // Entries keep their null slots; the plain reducers see only numbers
        let entries = numeric_entries(&self.container_entries(value)?)?;
        let numbers: Vec<f64> = entries.iter().flatten().copied().collect();

        let result = match func {
            FunctionKind::Sum => aggregates::sum(&numbers),
            FunctionKind::Min => aggregates::min(&numbers),
            FunctionKind::Max => aggregates::max(&numbers),
            FunctionKind::Average => aggregates::mean(&numbers),
            FunctionKind::Stddev => aggregates::std_dev(&numbers),
            FunctionKind::Variance => aggregates::variance(&numbers),
            FunctionKind::Median => aggregates::median(&numbers),
            // Count is over all collected entries, missing ones included
            FunctionKind::Count => Some(entries.len() as f64),
            FunctionKind::Percentile => {
                let Some(p) = test else { return Ok(None) };
                aggregates::percentile(&numbers, p)
            }
            // Ranks run over every entry too, so sparse windows keep their width
            FunctionKind::RankHigh => {
                let Some(test) = test else { return Ok(None) };
                aggregates::rank_high(&entries, test)
            }
            FunctionKind::RankLow => {
                let Some(test) = test else { return Ok(None) };
                aggregates::rank_low(&entries, test)
            }
            FunctionKind::RankPercentile => {
                let Some(test) = test else { return Ok(None) };
                if entries.is_empty() && self.mode != EvalMode::Evaluate {
                    Some(0.0)
                } else {
                    aggregates::rank_percentile(&entries, test)
                }
            }
            other => {
                return Err(ExpressionError::Internal(format!(
                    "{}() reached the aggregation handler",
                    other.name()
                )))
            }
        };

        Ok(result.map(Value::Number))
    }

    /// Force an aggregation argument into its collected entries.
    ///
    /// Outside Evaluate mode a scalar is accepted as a one-entry sequence,
    /// because unbound scope functions degrade to a single visit.
    fn container_entries(&self, value: Option<Value>) -> Result<Vec<Option<Value>>> {
        match value {
            Some(Value::Multi(container)) => Ok(container.into_values()),
            other => {
                if self.mode == EvalMode::Evaluate {
                    return Err(ExpressionError::Type(
                        "aggregation expects multiple values; apply it to a PERIOD or OU_* sub-expression"
                            .to_string(),
                    ));
                }
                Ok(match other {
                    Some(value) => vec![Some(value)],
                    None => Vec::new(),
                })
            }
        }
    }
}

/// Hint that a canonical aggregation attaches to the data references below it
fn aggregation_hint(func: FunctionKind) -> Option<AggregationType> {
    match func {
        FunctionKind::Sum => Some(AggregationType::Sum),
        FunctionKind::Average => Some(AggregationType::Average),
        FunctionKind::Min => Some(AggregationType::Min),
        FunctionKind::Max => Some(AggregationType::Max),
        FunctionKind::Count => Some(AggregationType::Count),
        FunctionKind::Stddev => Some(AggregationType::Stddev),
        FunctionKind::Variance => Some(AggregationType::Variance),
        FunctionKind::Median => Some(AggregationType::Median),
        _ => None,
    }
}

/// Numeric view of the collected entries, null slots preserved
fn numeric_entries(entries: &[Option<Value>]) -> Result<Vec<Option<f64>>> {
    entries
        .iter()
        .map(|entry| Value::as_number(entry.as_ref()))
        .collect()
}

fn add(left: Option<Value>, right: Option<Value>) -> Result<Option<Value>> {
    for side in [&left, &right] {
        if let Some(value @ (Value::Boolean(_) | Value::Multi(_))) = side {
            return Err(ExpressionError::Type(format!(
                "cannot add {}",
                value.kind_name()
            )));
        }
    }
    match (left, right) {
        (None, _) | (_, None) => Ok(None),
        (Some(Value::Number(left)), Some(Value::Number(right))) => {
            Ok(Some(Value::Number(left + right)))
        }
        (Some(Value::Text(left)), Some(Value::Text(right))) => {
            Ok(Some(Value::Text(format!("{}{}", left, right))))
        }
        _ => Err(ExpressionError::Type(
            "cannot add a number and text".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::DimensionItemKind;
    use crate::context::{OrgUnit, Period};
    use crate::providers::{CalendarPeriods, OrgUnitTree, StaticMetadata};
    use crate::token_parser::parse;
    use pretty_assertions::assert_eq;

    fn eval_with(
        source: &str,
        mode: EvalMode,
        values: &ValueMap,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let expr = parse(source)?;
        let tree = OrgUnitTree::new();
        let metadata = StaticMetadata::new();
        let mut evaluator = Evaluator::new(mode, values, &CalendarPeriods, &tree, &metadata);
        evaluator.evaluate(&expr, context)
    }

    fn eval(source: &str) -> Result<Option<Value>> {
        let values = ValueMap::new();
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202401"));
        eval_with(source, EvalMode::Evaluate, &values, &context)
    }

    fn number(source: &str) -> f64 {
        match eval(source).unwrap() {
            Some(Value::Number(n)) => n,
            other => panic!("expected a number from '{}', got {:?}", source, other),
        }
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(number("1 + 2 * 3"), 7.0);
        assert_eq!(number("(1 + 2) * 3"), 9.0);
        assert_eq!(number("7 % 3"), 1.0);
        assert_eq!(number("2 ^ -1"), 0.5);
        assert_eq!(number("-2 ^ 2"), -4.0);
    }

    #[test]
    fn test_division_by_zero_is_not_an_error() {
        assert_eq!(number("1 / 0"), f64::INFINITY);
        assert!(number("0 / 0").is_nan());
    }

    #[test]
    fn test_text_concatenation() {
        assert_eq!(
            eval("'ab' + 'cd'").unwrap(),
            Some(Value::Text("abcd".to_string()))
        );
        assert!(eval("1 + 'cd'").unwrap_err().to_string().contains("add"));
    }

    #[test]
    fn test_null_propagates_through_arithmetic() {
        // No data bound, so the reference is null
        assert_eq!(eval("#{fbfJHSPpUQD} + 1").unwrap(), None);
        assert_eq!(eval("-#{fbfJHSPpUQD}").unwrap(), None);
        assert_eq!(eval("1 + #{fbfJHSPpUQD}").unwrap(), None);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("1 < 2").unwrap(), Some(Value::Boolean(true)));
        assert_eq!(eval("2 <= 1").unwrap(), Some(Value::Boolean(false)));
        assert_eq!(eval("1 + 1 = 2").unwrap(), Some(Value::Boolean(true)));
        assert_eq!(eval("1 <> 2").unwrap(), Some(Value::Boolean(true)));
        assert_eq!(eval("'a' < 'b'").unwrap(), Some(Value::Boolean(true)));
        // Null or mixed-family comparison is null
        assert_eq!(eval("#{fbfJHSPpUQD} = 1").unwrap(), None);
        assert_eq!(eval("1 = 'a'").unwrap(), None);
    }

    #[test]
    fn test_and_or_null_asymmetry() {
        // A false left side decides AND before null is seen
        assert_eq!(
            eval("false AND (#{fbfJHSPpUQD} = 1)").unwrap(),
            Some(Value::Boolean(false))
        );
        // A null left side makes the result null even against false
        assert_eq!(eval("(#{fbfJHSPpUQD} = 1) AND false").unwrap(), None);

        assert_eq!(
            eval("true OR (#{fbfJHSPpUQD} = 1)").unwrap(),
            Some(Value::Boolean(true))
        );
        assert_eq!(eval("(#{fbfJHSPpUQD} = 1) OR true").unwrap(), None);

        assert_eq!(
            eval("true AND false").unwrap(),
            Some(Value::Boolean(false))
        );
        assert_eq!(eval("NOT true").unwrap(), Some(Value::Boolean(false)));
        assert_eq!(eval("NOT (#{fbfJHSPpUQD} = 1)").unwrap(), None);
    }

    #[test]
    fn test_if_short_circuits_in_evaluate_mode() {
        assert_eq!(number("IF(false, 1 / 0, 5)"), 5.0);
        assert_eq!(number("IF(true, 4, 1 / 0)"), 4.0);
        assert_eq!(eval("IF(#{fbfJHSPpUQD} = 1, 1, 2)").unwrap(), None);
    }

    #[test]
    fn test_coalesce_and_except() {
        assert_eq!(number("COALESCE(#{fbfJHSPpUQD}, 7, 9)"), 7.0);
        assert_eq!(eval("COALESCE(#{fbfJHSPpUQD})").unwrap(), None);
        assert_eq!(eval("EXCEPT(true, 5)").unwrap(), None);
        assert_eq!(number("EXCEPT(false, 5)"), 5.0);
        assert_eq!(number("EXCEPT(#{fbfJHSPpUQD} = 1, 5)"), 5.0);
    }

    #[test]
    fn test_is_null() {
        assert_eq!(
            eval("IS_NULL(#{fbfJHSPpUQD})").unwrap(),
            Some(Value::Boolean(true))
        );
        assert_eq!(eval("IS_NULL(3)").unwrap(), Some(Value::Boolean(false)));
    }

    #[test]
    fn test_data_item_lookup_uses_full_key() {
        let org_unit = OrgUnit::new("O1");
        let period = Period::new("202401");
        let mut values = ValueMap::new();
        values.insert(
            ExpressionItem {
                org_unit: org_unit.clone(),
                period: period.clone(),
                item: crate::ast::DimensionItem::new(
                    DimensionItemKind::DataElement,
                    "fbfJHSPpUQD",
                ),
                aggregation: None,
            },
            12.5,
        );
        let context = EvalContext::new(org_unit, period);

        let result = eval_with("#{fbfJHSPpUQD} * 2", EvalMode::Evaluate, &values, &context);
        assert_eq!(result.unwrap(), Some(Value::Number(25.0)));
    }

    #[test]
    fn test_constant_and_count_resolution() {
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202401"))
            .with_constants([("gQNFkFkObU8".to_string(), 0.5)].into())
            .with_org_unit_counts([("CXw2yu5fodb".to_string(), 14.0)].into());
        let values = ValueMap::new();

        let result = eval_with(
            "C{gQNFkFkObU8} * OUG{CXw2yu5fodb}",
            EvalMode::Evaluate,
            &values,
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(7.0)));

        let err = eval_with("C{missing0000}", EvalMode::Evaluate, &values, &context).unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedReference(_)));

        // An absent count is missing data, not a bad reference
        assert_eq!(
            eval_with("OUG{missing0000}", EvalMode::Evaluate, &values, &context).unwrap(),
            None
        );
    }

    #[test]
    fn test_days_value() {
        let values = ValueMap::new();
        let context =
            EvalContext::new(OrgUnit::new("O1"), Period::new("202401")).with_days(31.0);
        let result = eval_with("[days] - 1", EvalMode::Evaluate, &values, &context);
        assert_eq!(result.unwrap(), Some(Value::Number(30.0)));

        let unbound = EvalContext::new(OrgUnit::new("O1"), Period::new("202401"));
        assert_eq!(
            eval_with("[days]", EvalMode::Evaluate, &values, &unbound).unwrap(),
            None
        );

        // Outside Evaluate an unbound days reads as the placeholder, the
        // same fallback constants and counts use
        assert_eq!(
            eval_with("[days]", EvalMode::Discover, &values, &unbound).unwrap(),
            Some(Value::Number(PLACEHOLDER))
        );
    }

    #[test]
    fn test_discover_visits_both_branches() {
        let values = ValueMap::new();
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202401"));
        let expr = parse("IF(#{cond0000001} > 0, #{then0000001}, #{else0000001})").unwrap();
        let tree = OrgUnitTree::new();
        let metadata = StaticMetadata::new();
        let mut evaluator =
            Evaluator::new(EvalMode::Discover, &values, &CalendarPeriods, &tree, &metadata);
        evaluator.evaluate(&expr, &context).unwrap();

        let ids: HashSet<String> = evaluator
            .into_items()
            .into_iter()
            .map(|item| item.item.id)
            .collect();
        assert_eq!(
            ids,
            ["cond0000001", "then0000001", "else0000001"]
                .into_iter()
                .map(String::from)
                .collect()
        );
    }

    #[test]
    fn test_discover_tolerates_missing_context() {
        // The syntax-check configuration: Discover with nothing bound
        let values = ValueMap::new();
        let context = EvalContext::unbound();
        let result = eval_with(
            "SUM(PERIOD(-3, -1, #{fbfJHSPpUQD})) / C{gQNFkFkObU8}",
            EvalMode::Discover,
            &values,
            &context,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_aggregation_rejects_scalar_in_evaluate_mode() {
        let err = eval("SUM(3)").unwrap_err();
        assert!(matches!(err, ExpressionError::Type(_)));
        let err = eval("FIRST(3)").unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidComposition(_)));
    }

    #[test]
    fn test_describe_records_names() {
        let mut metadata = StaticMetadata::new();
        metadata.add_data_item("#{fbfJHSPpUQD}", "ANC 1st visit");
        metadata.add_constant("gQNFkFkObU8", "Coverage factor");
        let values = ValueMap::new();
        let expr = parse("#{fbfJHSPpUQD} * C{gQNFkFkObU8}").unwrap();
        let tree = OrgUnitTree::new();
        let mut evaluator =
            Evaluator::new(EvalMode::Describe, &values, &CalendarPeriods, &tree, &metadata);
        evaluator.evaluate(&expr, &EvalContext::unbound()).unwrap();

        assert_eq!(
            evaluator.names().get("#{fbfJHSPpUQD}"),
            Some(&"ANC 1st visit".to_string())
        );
        assert_eq!(
            evaluator.names().get("C{gQNFkFkObU8}"),
            Some(&"Coverage factor".to_string())
        );
    }

    #[test]
    fn test_describe_requires_known_names() {
        let values = ValueMap::new();
        let context = EvalContext::unbound();
        let err = eval_with("#{unknown0001}", EvalMode::Describe, &values, &context).unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedReference(_)));
    }
}
