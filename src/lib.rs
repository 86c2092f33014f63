//! adex - aggregate data expression engine
//!
//! Parses and evaluates the expression language used for indicator formulas
//! and validation rules over health-style reporting data: nullable numeric
//! values addressed by organisation unit, period, and dimensional item. The
//! same expression tree serves three walks: computing a value, discovering
//! the data an expression depends on, and rendering a human-readable
//! description.
//!
//! ```
//! use adex::{EvalContext, EvaluationData, ExpressionEngine, OrgUnit, Period};
//! use adex::providers::{CalendarPeriods, OrgUnitTree, StaticMetadata};
//!
//! let engine = ExpressionEngine::new();
//! let values = adex::ValueMap::new();
//! let tree = OrgUnitTree::new();
//! let metadata = StaticMetadata::new();
//! let data = EvaluationData {
//!     values: &values,
//!     periods: &CalendarPeriods,
//!     org_units: &tree,
//!     metadata: &metadata,
//! };
//! let context = EvalContext::new(OrgUnit::new("O1"), Period::new("202401"));
//!
//! let result = engine.evaluate("(2 + 3) * 10", &data, &context).unwrap();
//! assert_eq!(result, Some(50.0));
//! ```

pub mod aggregates;
pub mod ast;
pub mod cache;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod multi_values;
pub mod providers;
pub mod token_parser;
pub mod value;

mod scope;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

// Re-export commonly used types
pub use ast::{DimensionItem, DimensionItemKind, Expr};
pub use cache::ExpressionCache;
pub use context::{AggregationType, EvalContext, ExpressionItem, OrgUnit, Period, ValueMap};
pub use error::{ExpressionError, Result};
pub use evaluator::{EvalMode, Evaluator};
pub use lexer::{Token, TokenKind};
pub use multi_values::MultiValues;
pub use providers::{MetadataResolver, OrgUnitLocator, PeriodEngine};
pub use value::Value;

use providers::{CalendarPeriods, OrgUnitTree, StaticMetadata};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse expression text without caching
pub fn parse_str(input: &str) -> Result<Expr> {
    token_parser::parse(input)
}

/// The external data one evaluation call draws on
///
/// The value table is keyed by [`ExpressionItem`]; the three collaborators
/// supply period arithmetic, hierarchy walking, and display names. Constant
/// and count tables travel in the [`EvalContext`] instead, since scope
/// functions rebind coordinates but never the tables.
pub struct EvaluationData<'a> {
    pub values: &'a ValueMap,
    pub periods: &'a dyn PeriodEngine,
    pub org_units: &'a dyn OrgUnitLocator,
    pub metadata: &'a dyn MetadataResolver,
}

/// Parse-once, evaluate-many entry point
///
/// Holds the parse-tree cache; everything else is borrowed per call, so one
/// engine can serve many independent evaluations. The cache is injected
/// rather than global, letting callers size or share it deliberately.
pub struct ExpressionEngine {
    cache: ExpressionCache,
}

impl ExpressionEngine {
    /// Create an engine with the default cache capacity
    pub fn new() -> Self {
        Self {
            cache: ExpressionCache::with_default_capacity(),
        }
    }

    /// Create an engine around an existing cache
    pub fn with_cache(cache: ExpressionCache) -> Self {
        Self { cache }
    }

    /// The engine's parse-tree cache
    pub fn cache(&self) -> &ExpressionCache {
        &self.cache
    }

    /// Parse through the cache, sharing the tree with earlier callers
    pub fn parse(&self, text: &str) -> Result<Arc<Expr>> {
        self.cache.get_or_parse(text, parse_str)
    }

    /// Check that text parses and composes, without data or coordinates
    ///
    /// Walks every branch in discovery mode under an unbound context, so
    /// grammar and composition errors surface while data references, period
    /// shifts, and hierarchy fan-outs are passed through.
    pub fn check(&self, text: &str) -> Result<()> {
        let expr = self.parse(text)?;
        let values = ValueMap::new();
        let tree = OrgUnitTree::new();
        let metadata = StaticMetadata::new();
        let mut evaluator = Evaluator::new(
            EvalMode::Discover,
            &values,
            &CalendarPeriods,
            &tree,
            &metadata,
        );
        evaluator.evaluate(&expr, &EvalContext::unbound())?;
        Ok(())
    }

    /// Evaluate an expression to its nullable numeric result
    ///
    /// The final value must be numeric or null; a boolean, text, or
    /// collection result at the top level is a type error.
    pub fn evaluate(
        &self,
        text: &str,
        data: &EvaluationData,
        context: &EvalContext,
    ) -> Result<Option<f64>> {
        let value = self.evaluate_value(text, data, context)?;
        let number = Value::as_number(value.as_ref())?;
        debug!(expression = text, result = ?number, "evaluated expression");
        Ok(number)
    }

    /// Evaluate an expression to its raw value, whatever its type
    pub fn evaluate_value(
        &self,
        text: &str,
        data: &EvaluationData,
        context: &EvalContext,
    ) -> Result<Option<Value>> {
        let expr = self.parse(text)?;
        let mut evaluator = Evaluator::new(
            EvalMode::Evaluate,
            data.values,
            data.periods,
            data.org_units,
            data.metadata,
        );
        evaluator.evaluate(&expr, context)
    }

    /// Collect the data dependencies of an expression
    ///
    /// Every branch is visited, so conditions, unpicked branches, and all
    /// fanned-out coordinates contribute items.
    pub fn expression_items(
        &self,
        text: &str,
        data: &EvaluationData,
        context: &EvalContext,
    ) -> Result<HashSet<ExpressionItem>> {
        let expr = self.parse(text)?;
        let mut evaluator = Evaluator::new(
            EvalMode::Discover,
            data.values,
            data.periods,
            data.org_units,
            data.metadata,
        );
        evaluator.evaluate(&expr, context)?;
        let items = evaluator.into_items();
        debug!(expression = text, items = items.len(), "discovered items");
        Ok(items)
    }

    /// Render a description by substituting display names for references
    ///
    /// Unknown references are an [`ExpressionError::UnresolvedReference`].
    pub fn describe(&self, text: &str, metadata: &dyn MetadataResolver) -> Result<String> {
        let expr = self.parse(text)?;
        let values = ValueMap::new();
        let tree = OrgUnitTree::new();
        let mut evaluator = Evaluator::new(
            EvalMode::Describe,
            &values,
            &CalendarPeriods,
            &tree,
            metadata,
        );
        evaluator.evaluate(&expr, &EvalContext::unbound())?;

        let mut described = text.to_string();
        for (raw, name) in evaluator.names() {
            described = described.replace(raw.as_str(), name.as_str());
        }
        Ok(described)
    }

    /// Describe, degrading to the raw text when it does not parse
    ///
    /// Only syntax errors degrade; semantic errors such as an unknown
    /// reference still propagate.
    pub fn describe_lenient(&self, text: &str, metadata: &dyn MetadataResolver) -> Result<String> {
        match self.describe(text, metadata) {
            Ok(described) => Ok(described),
            Err(err) if err.is_syntax() => {
                warn!(expression = text, error = %err, "describing unparseable text verbatim");
                Ok(text.to_string())
            }
            Err(err) => Err(err),
        }
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}
