//! Fan-out of a sub-expression over shifted periods or related organisation units
//!
//! Scope functions rebind the evaluation coordinates of their body. With no
//! matching coordinate bound (the syntax-check configuration) the body is
//! visited once unchanged, so every mode can walk the full tree.

use std::collections::HashSet;

use crate::ast::{Expr, OrgSelector, PeriodSpec};
use crate::context::{EvalContext, OrgUnit, Period};
use crate::error::{ExpressionError, Result};
use crate::evaluator::Evaluator;
use crate::multi_values::MultiValues;
use crate::value::Value;

pub(crate) fn period_scope(
    evaluator: &mut Evaluator,
    spec: &PeriodSpec,
    body: &Expr,
    context: &EvalContext,
) -> Result<Option<Value>> {
    let Some(base) = context.period.clone() else {
        return evaluator.evaluate(body, context);
    };

    match spec {
        PeriodSpec::Single(offset) => {
            let shifted = shift(evaluator, &base, 0, *offset)?;
            evaluator.evaluate(body, &context.at_period(shifted))
        }
        PeriodSpec::Windows(windows) => {
            let mut collected = MultiValues::new();
            for window in windows {
                for year in steps(window.year_from, window.year_to) {
                    for offset in steps(window.period_from, window.period_to) {
                        let shifted = shift(evaluator, &base, year, offset)?;
                        let value =
                            evaluator.evaluate(body, &context.at_period(shifted.clone()))?;
                        // Nulls are kept so COUNT sees every visited period
                        collected.add_period_value(shifted, value)?;
                    }
                }
            }
            Ok(Some(Value::Multi(collected)))
        }
    }
}

pub(crate) fn org_scope(
    evaluator: &mut Evaluator,
    selector: &OrgSelector,
    body: &Expr,
    context: &EvalContext,
) -> Result<Option<Value>> {
    let Some(base) = context.org_unit.clone() else {
        return evaluator.evaluate(body, context);
    };

    let candidates: Vec<OrgUnit> = match selector {
        OrgSelector::Ancestor { steps } => {
            let mut unit = base;
            for _ in 0..*steps {
                match evaluator.org_units.parent(&unit) {
                    Some(parent) => unit = parent,
                    None => break, // clamp at the root
                }
            }
            return evaluator.evaluate(body, &context.at_org_unit(unit));
        }
        OrgSelector::Descendant { depths } => depths
            .iter()
            .flat_map(|depth| evaluator.org_units.descendants_at_depth(&base, *depth))
            .collect(),
        OrgSelector::Level { levels } => levels
            .iter()
            .flat_map(|level| evaluator.org_units.units_at_level(*level))
            .collect(),
        OrgSelector::Peer { distance } => evaluator.org_units.peers(&base, *distance),
        OrgSelector::Group { names } => {
            let mut members = Vec::new();
            for name in names {
                let group = evaluator.metadata.find_org_unit_group(name).ok_or_else(|| {
                    ExpressionError::UnresolvedReference(format!(
                        "organisation unit group not found: {}",
                        name
                    ))
                })?;
                members.extend(evaluator.org_units.group_members(&group.uid));
            }
            members
        }
        OrgSelector::DataSet { names } => {
            let mut members = Vec::new();
            for name in names {
                let data_set = evaluator.metadata.find_data_set(name).ok_or_else(|| {
                    ExpressionError::UnresolvedReference(format!("data set not found: {}", name))
                })?;
                members.extend(evaluator.org_units.data_set_members(&data_set.uid));
            }
            members
        }
    };
    let candidates = distinct(candidates);

    if context.filtering {
        // Nested selectors intersect: the inner one narrows the outer fan-out
        if candidates.contains(&base) {
            return evaluator.evaluate(body, context);
        }
        return Ok(None);
    }

    let filtering = context.filtering();
    let mut collected = MultiValues::new();
    for candidate in candidates {
        let value = evaluator.evaluate(body, &filtering.at_org_unit(candidate))?;
        // Units with no value at all are dropped from the collection
        if value.is_some() {
            collected.add_value(value)?;
        }
    }
    Ok(Some(Value::Multi(collected)))
}

/// Shift a period by whole years first, then by period steps
fn shift(evaluator: &Evaluator, base: &Period, years: i32, offsets: i32) -> Result<Period> {
    let mut period = base.clone();
    if years != 0 {
        period = evaluator
            .periods
            .shift_year(&period, years)
            .ok_or_else(|| unshiftable(base))?;
    }
    if offsets != 0 {
        period = evaluator
            .periods
            .shift_period(&period, offsets)
            .ok_or_else(|| unshiftable(base))?;
    }
    Ok(period)
}

fn unshiftable(period: &Period) -> ExpressionError {
    ExpressionError::UnresolvedReference(format!("cannot shift period {}", period))
}

/// Inclusive steps from one bound to the other, descending when reversed
fn steps(from: i32, to: i32) -> Box<dyn Iterator<Item = i32>> {
    if from <= to {
        Box::new(from..=to)
    } else {
        Box::new((to..=from).rev())
    }
}

fn distinct(units: Vec<OrgUnit>) -> Vec<OrgUnit> {
    let mut seen = HashSet::new();
    units.into_iter().filter(|unit| seen.insert(unit.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{DimensionItem, DimensionItemKind};
    use crate::context::{AggregationType, ExpressionItem, ValueMap};
    use crate::evaluator::EvalMode;
    use crate::providers::{CalendarPeriods, OrgUnitTree, StaticMetadata};
    use crate::token_parser::parse;
    use pretty_assertions::assert_eq;

    fn insert(
        values: &mut ValueMap,
        org_unit: &str,
        period: &str,
        uid: &str,
        aggregation: Option<AggregationType>,
        value: f64,
    ) {
        values.insert(
            ExpressionItem {
                org_unit: OrgUnit::new(org_unit),
                period: Period::new(period),
                item: DimensionItem::new(DimensionItemKind::DataElement, uid),
                aggregation,
            },
            value,
        );
    }

    fn sample_tree() -> OrgUnitTree {
        let mut tree = OrgUnitTree::new();
        tree.add_root("National")
            .add_child("DistrictA", "National")
            .add_child("DistrictB", "National")
            .add_child("ClinicA1", "DistrictA")
            .add_child("ClinicA2", "DistrictA")
            .add_child("ClinicB1", "DistrictB")
            .add_group(
                "OUGurban0001",
                vec!["ClinicA1".to_string(), "ClinicB1".to_string()],
            );
        tree
    }

    fn evaluate(
        source: &str,
        values: &ValueMap,
        tree: &OrgUnitTree,
        metadata: &StaticMetadata,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let expr = parse(source)?;
        let mut evaluator =
            Evaluator::new(EvalMode::Evaluate, values, &CalendarPeriods, tree, metadata);
        evaluator.evaluate(&expr, context)
    }

    #[test]
    fn test_single_shift_rebinds_the_period() {
        let mut values = ValueMap::new();
        insert(&mut values, "O1", "202401", "fbfJHSPpUQD", None, 11.0);
        insert(&mut values, "O1", "202402", "fbfJHSPpUQD", None, 22.0);
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202402"));

        let result = evaluate(
            "PERIOD(-1, #{fbfJHSPpUQD})",
            &values,
            &OrgUnitTree::new(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(11.0)));
    }

    #[test]
    fn test_window_sum_over_three_months() {
        let mut values = ValueMap::new();
        for (period, value) in [("202401", 10.0), ("202402", 20.0), ("202403", 30.0)] {
            insert(
                &mut values,
                "O1",
                period,
                "fbfJHSPpUQD",
                Some(AggregationType::Sum),
                value,
            );
        }
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202404"));

        let result = evaluate(
            "SUM(PERIOD(-3, -1, #{fbfJHSPpUQD}))",
            &values,
            &OrgUnitTree::new(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(60.0)));
    }

    #[test]
    fn test_year_over_year_window() {
        let mut values = ValueMap::new();
        insert(
            &mut values,
            "O1",
            "202306",
            "fbfJHSPpUQD",
            Some(AggregationType::Average),
            40.0,
        );
        insert(
            &mut values,
            "O1",
            "202206",
            "fbfJHSPpUQD",
            Some(AggregationType::Average),
            20.0,
        );
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202406"));

        // Same month in each of the two previous years
        let result = evaluate(
            "AVERAGE(PERIOD(0, 0, -2, -1, #{fbfJHSPpUQD}))",
            &values,
            &OrgUnitTree::new(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(30.0)));
    }

    #[test]
    fn test_window_keeps_missing_periods_for_count() {
        let mut values = ValueMap::new();
        insert(
            &mut values,
            "O1",
            "202402",
            "fbfJHSPpUQD",
            Some(AggregationType::Count),
            5.0,
        );
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202404"));

        let result = evaluate(
            "COUNT(PERIOD(-3, -1, #{fbfJHSPpUQD}))",
            &values,
            &OrgUnitTree::new(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_chained_period_scopes_need_an_aggregation() {
        let values = ValueMap::new();
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202404"));

        let err = evaluate(
            "SUM(PERIOD(-2, -1, PERIOD(-2, -1, #{fbfJHSPpUQD})))",
            &values,
            &OrgUnitTree::new(),
            &StaticMetadata::new(),
            &context,
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidComposition(_)));
    }

    #[test]
    fn test_descendant_fan_out_sums_children() {
        let mut values = ValueMap::new();
        for (unit, value) in [("DistrictA", 4.0), ("DistrictB", 6.0)] {
            insert(
                &mut values,
                unit,
                "202401",
                "fbfJHSPpUQD",
                Some(AggregationType::Sum),
                value,
            );
        }
        let context = EvalContext::new(OrgUnit::new("National"), Period::new("202401"));

        let result = evaluate(
            "SUM(OU_DESCENDANT(1, #{fbfJHSPpUQD}))",
            &values,
            &sample_tree(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(10.0)));
    }

    #[test]
    fn test_nested_selectors_intersect() {
        let mut values = ValueMap::new();
        for unit in ["ClinicA1", "ClinicA2", "ClinicB1"] {
            insert(
                &mut values,
                unit,
                "202401",
                "fbfJHSPpUQD",
                Some(AggregationType::Sum),
                1.0,
            );
        }
        let mut metadata = StaticMetadata::new();
        metadata.add_org_unit_group(crate::providers::MetadataEntry {
            uid: "OUGurban0001".to_string(),
            code: None,
            name: "Urban".to_string(),
        });
        let context = EvalContext::new(OrgUnit::new("National"), Period::new("202401"));

        // Descendants two levels down that are also in the urban group,
        // the group referenced by display name
        let result = evaluate(
            "SUM(OU_DESCENDANT(2, OU_GROUP('Urban', #{fbfJHSPpUQD})))",
            &values,
            &sample_tree(),
            &metadata,
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_ancestor_walks_up_and_clamps() {
        let mut values = ValueMap::new();
        insert(&mut values, "National", "202401", "fbfJHSPpUQD", None, 9.0);
        let context = EvalContext::new(OrgUnit::new("ClinicA1"), Period::new("202401"));

        let result = evaluate(
            "OU_ANCESTOR(2, #{fbfJHSPpUQD})",
            &values,
            &sample_tree(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(result.unwrap(), Some(Value::Number(9.0)));

        let clamped = evaluate(
            "OU_ANCESTOR(5, #{fbfJHSPpUQD})",
            &values,
            &sample_tree(),
            &StaticMetadata::new(),
            &context,
        );
        assert_eq!(clamped.unwrap(), Some(Value::Number(9.0)));
    }

    #[test]
    fn test_unknown_group_is_an_unresolved_reference() {
        let values = ValueMap::new();
        let context = EvalContext::new(OrgUnit::new("National"), Period::new("202401"));

        let err = evaluate(
            "SUM(OU_GROUP('nowhere', #{fbfJHSPpUQD}))",
            &values,
            &sample_tree(),
            &StaticMetadata::new(),
            &context,
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedReference(_)));
    }

    #[test]
    fn test_unshiftable_period_is_reported() {
        let values = ValueMap::new();
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("not-a-period"));

        let err = evaluate(
            "PERIOD(-1, #{fbfJHSPpUQD})",
            &values,
            &OrgUnitTree::new(),
            &StaticMetadata::new(),
            &context,
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedReference(_)));
    }

    #[test]
    fn test_first_and_last_over_period_window() {
        let mut values = ValueMap::new();
        for (period, value) in [("202401", 10.0), ("202402", 20.0), ("202403", 30.0)] {
            insert(
                &mut values,
                "O1",
                period,
                "fbfJHSPpUQD",
                Some(AggregationType::First),
                value,
            );
            insert(
                &mut values,
                "O1",
                period,
                "fbfJHSPpUQD",
                Some(AggregationType::Last),
                value,
            );
        }
        let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202404"));
        let tree = OrgUnitTree::new();
        let metadata = StaticMetadata::new();

        let first = evaluate(
            "FIRST(PERIOD(-3, -1, #{fbfJHSPpUQD}))",
            &values,
            &tree,
            &metadata,
            &context,
        );
        assert_eq!(first.unwrap(), Some(Value::Number(10.0)));

        let last_two = evaluate(
            "SUM(LAST(PERIOD(-3, -1, #{fbfJHSPpUQD}), 2))",
            &values,
            &tree,
            &metadata,
            &context,
        );
        assert_eq!(last_two.unwrap(), Some(Value::Number(50.0)));
    }
}
