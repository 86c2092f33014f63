//! Token-based parser for aggregate data expressions
//!
//! Recursive descent over the lexer's token stream. Besides building the
//! tree, the parser settles everything that is static about a call site:
//! function names (case-insensitive) map onto the closed `FunctionKind` set,
//! arities are checked, and scope-function specs are required to be literals
//! and are resolved into `PeriodSpec`/`OrgSelector` values. The evaluator
//! never sees a malformed call.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::ast::{
    BinaryOperator, DimensionItem, DimensionItemKind, Expr, FunctionKind, OrgSelector, PeriodSpec,
    PeriodWindow, UnaryOperator,
};
use crate::error::{ExpressionError, Result};
use crate::lexer::{Token, TokenKind};

/// Functions that parse into dedicated scope nodes rather than `Expr::Function`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Period,
    OuAncestor,
    OuDescendant,
    OuLevel,
    OuPeer,
    OuGroup,
    OuDataSet,
}

lazy_static! {
    /// Lower-cased name -> kind for conditionals and aggregations
    static ref FUNCTIONS: HashMap<&'static str, FunctionKind> = {
        let mut m = HashMap::new();
        m.insert("if", FunctionKind::If);
        m.insert("coalesce", FunctionKind::Coalesce);
        m.insert("except", FunctionKind::Except);
        m.insert("is_null", FunctionKind::IsNull);
        m.insert("sum", FunctionKind::Sum);
        m.insert("min", FunctionKind::Min);
        m.insert("max", FunctionKind::Max);
        m.insert("average", FunctionKind::Average);
        m.insert("stddev", FunctionKind::Stddev);
        m.insert("variance", FunctionKind::Variance);
        m.insert("median", FunctionKind::Median);
        m.insert("percentile", FunctionKind::Percentile);
        m.insert("count", FunctionKind::Count);
        m.insert("first", FunctionKind::First);
        m.insert("last", FunctionKind::Last);
        m.insert("rank_high", FunctionKind::RankHigh);
        m.insert("rank_low", FunctionKind::RankLow);
        m.insert("rank_percentile", FunctionKind::RankPercentile);
        m
    };

    /// Lower-cased name -> scope function
    static ref SCOPE_FUNCTIONS: HashMap<&'static str, ScopeKind> = {
        let mut m = HashMap::new();
        m.insert("period", ScopeKind::Period);
        m.insert("ou_ancestor", ScopeKind::OuAncestor);
        m.insert("ou_descendant", ScopeKind::OuDescendant);
        m.insert("ou_level", ScopeKind::OuLevel);
        m.insert("ou_peer", ScopeKind::OuPeer);
        m.insert("ou_group", ScopeKind::OuGroup);
        m.insert("ou_data_set", ScopeKind::OuDataSet);
        m
    };
}

/// Parser that consumes tokens to produce an expression tree
pub struct TokenParser {
    tokens: Vec<Token>,
    position: usize,
}

impl TokenParser {
    /// Create a new parser from a token stream
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse a complete expression; trailing tokens are an error
    pub fn parse_expression_tree(&mut self) -> Result<Expr> {
        let expr = self.parse_expression()?;
        if !self.is_at_end() {
            return Err(self.error_here(format!(
                "unexpected token '{}' after expression",
                self.current().span.text
            )));
        }
        Ok(expr)
    }

    /// Parse an expression (entry point for the precedence chain)
    fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;

        while self.check(&TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOperator::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;

        while self.check(&TokenKind::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOperator::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = if self.check(&TokenKind::Equal) {
                BinaryOperator::Equal
            } else if self.check(&TokenKind::NotEqual) {
                BinaryOperator::NotEqual
            } else {
                break;
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;

        loop {
            let op = if self.check(&TokenKind::Less) {
                BinaryOperator::Less
            } else if self.check(&TokenKind::LessEqual) {
                BinaryOperator::LessEqual
            } else if self.check(&TokenKind::Greater) {
                BinaryOperator::Greater
            } else if self.check(&TokenKind::GreaterEqual) {
                BinaryOperator::GreaterEqual
            } else {
                break;
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = if self.check(&TokenKind::Plus) {
                BinaryOperator::Add
            } else if self.check(&TokenKind::Minus) {
                BinaryOperator::Subtract
            } else {
                break;
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = if self.check(&TokenKind::Star) {
                BinaryOperator::Multiply
            } else if self.check(&TokenKind::Slash) {
                BinaryOperator::Divide
            } else if self.check(&TokenKind::Percent) {
                BinaryOperator::Modulo
            } else {
                break;
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Unary operators; `^` binds tighter, so `-2^2` is `-(2^2)`
    fn parse_unary(&mut self) -> Result<Expr> {
        if self.check(&TokenKind::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOperator::Negate,
                operand: Box::new(operand),
            });
        }

        if self.check(&TokenKind::Plus) {
            // Unary plus is a no-op
            self.advance();
            return self.parse_unary();
        }

        if self.check(&TokenKind::Not) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOperator::Not,
                operand: Box::new(operand),
            });
        }

        self.parse_power()
    }

    /// Right-associative power: `2^3^2` is `2^(3^2)`
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;

        if self.check(&TokenKind::Caret) {
            self.advance();
            // Exponent re-enters at unary so `2^-3` parses
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOperator::Power,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }

        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current().clone();

        match &token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(*n))
            }

            TokenKind::Text(s) => {
                self.advance();
                Ok(Expr::Text(s.clone()))
            }

            TokenKind::True => {
                self.advance();
                Ok(Expr::Boolean(true))
            }

            TokenKind::False => {
                self.advance();
                Ok(Expr::Boolean(false))
            }

            TokenKind::Days => {
                self.advance();
                Ok(Expr::Days)
            }

            TokenKind::Reference { prefix, id } => {
                self.advance();
                self.reference_expr(prefix, id, &token)
            }

            TokenKind::Word(_) => self.parse_function_call(),

            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')'")?;
                Ok(expr)
            }

            TokenKind::Eof => Err(self.error_at(&token, "unexpected end of expression")),

            _ => Err(self.error_at(
                &token,
                format!("unexpected token '{}'", token.span.text),
            )),
        }
    }

    /// Turn a lexed reference token into the matching AST node
    fn reference_expr(&self, prefix: &str, id: &str, token: &Token) -> Result<Expr> {
        let raw = token.span.text.clone();
        let dots = id.matches('.').count();
        let has_empty_segment = id.split('.').any(|s| s.is_empty());

        // Only data elements and attributes take a dotted second identifier
        let dots_allowed = match prefix {
            "#" | "A" => 1,
            _ => 0,
        };
        if dots > dots_allowed || has_empty_segment {
            return Err(self.error_at(token, format!("malformed reference '{}'", raw)));
        }

        let expr = match prefix {
            "#" => {
                let kind = if dots == 1 {
                    DimensionItemKind::DataElementOperand
                } else {
                    DimensionItemKind::DataElement
                };
                Expr::DataItem {
                    item: DimensionItem::new(kind, id),
                    raw,
                }
            }
            "A" => Expr::DataItem {
                item: DimensionItem::new(DimensionItemKind::Attribute, id),
                raw,
            },
            "I" => Expr::DataItem {
                item: DimensionItem::new(DimensionItemKind::Indicator, id),
                raw,
            },
            "R" => Expr::DataItem {
                item: DimensionItem::new(DimensionItemKind::ReportingRate, id),
                raw,
            },
            "C" => Expr::Constant {
                uid: id.to_string(),
                raw,
            },
            "OUG" => Expr::OrgUnitCount {
                uid: id.to_string(),
                raw,
            },
            other => {
                return Err(ExpressionError::Internal(format!(
                    "lexer produced unknown reference prefix '{}'",
                    other
                )))
            }
        };

        Ok(expr)
    }

    /// Parse `name(args...)`, classifying the name
    fn parse_function_call(&mut self) -> Result<Expr> {
        let name_token = self.current().clone();
        let name = match &name_token.kind {
            TokenKind::Word(name) => name.clone(),
            _ => {
                return Err(ExpressionError::Internal(
                    "function call parse entered on a non-word token".to_string(),
                ))
            }
        };
        self.advance();

        self.expect(&TokenKind::LeftParen, "'(' after function name")?;
        let args = self.parse_arguments()?;
        self.expect(&TokenKind::RightParen, "')'")?;

        let lower = name.to_ascii_lowercase();
        if let Some(kind) = SCOPE_FUNCTIONS.get(lower.as_str()) {
            return self.scope_call(*kind, args, &name_token);
        }
        if let Some(func) = FUNCTIONS.get(lower.as_str()) {
            return self.function_call(*func, args, &name_token);
        }

        Err(self.error_at(&name_token, format!("unknown function '{}'", name)))
    }

    /// Parse a comma-separated argument list (possibly empty)
    fn parse_arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();

        if !self.check(&TokenKind::RightParen) {
            args.push(self.parse_expression()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                args.push(self.parse_expression()?);
            }
        }

        Ok(args)
    }

    /// Arity-check a conditional or aggregation call
    fn function_call(&self, func: FunctionKind, args: Vec<Expr>, token: &Token) -> Result<Expr> {
        let ok = match func {
            FunctionKind::If => args.len() == 3,
            FunctionKind::Coalesce => !args.is_empty(),
            FunctionKind::Except => args.len() == 2,
            FunctionKind::IsNull => args.len() == 1,
            FunctionKind::Percentile
            | FunctionKind::RankHigh
            | FunctionKind::RankLow
            | FunctionKind::RankPercentile => args.len() == 2,
            FunctionKind::First | FunctionKind::Last => args.len() == 1 || args.len() == 2,
            _ => args.len() == 1,
        };

        if !ok {
            return Err(self.error_at(
                token,
                format!(
                    "{}() does not take {} argument(s)",
                    func.name(),
                    args.len()
                ),
            ));
        }

        Ok(Expr::Function { func, args })
    }

    /// Build a scope node; specs must be literals, the last argument is the body
    fn scope_call(&self, kind: ScopeKind, mut args: Vec<Expr>, token: &Token) -> Result<Expr> {
        let name = match kind {
            ScopeKind::Period => "PERIOD",
            ScopeKind::OuAncestor => "OU_ANCESTOR",
            ScopeKind::OuDescendant => "OU_DESCENDANT",
            ScopeKind::OuLevel => "OU_LEVEL",
            ScopeKind::OuPeer => "OU_PEER",
            ScopeKind::OuGroup => "OU_GROUP",
            ScopeKind::OuDataSet => "OU_DATA_SET",
        };

        if args.len() < 2 {
            return Err(self.error_at(
                token,
                format!("{}() expects shift/selector arguments and a sub-expression", name),
            ));
        }
        let body = Box::new(args.pop().ok_or_else(|| {
            ExpressionError::Internal("argument list emptied during scope parse".to_string())
        })?);

        match kind {
            ScopeKind::Period => {
                let shifts = self.int_specs(&args, token, name)?;
                let spec = if shifts.len() == 1 {
                    PeriodSpec::Single(shifts[0])
                } else {
                    PeriodSpec::Windows(chunk_windows(&shifts))
                };
                Ok(Expr::PeriodScope { spec, body })
            }

            ScopeKind::OuAncestor => {
                let steps = self.single_positive_spec(&args, token, name)?;
                Ok(Expr::OrgScope {
                    selector: OrgSelector::Ancestor { steps },
                    body,
                })
            }

            ScopeKind::OuPeer => {
                let distance = self.single_positive_spec(&args, token, name)?;
                Ok(Expr::OrgScope {
                    selector: OrgSelector::Peer { distance },
                    body,
                })
            }

            ScopeKind::OuDescendant => {
                let depths = self.positive_specs(&args, token, name)?;
                Ok(Expr::OrgScope {
                    selector: OrgSelector::Descendant { depths },
                    body,
                })
            }

            ScopeKind::OuLevel => {
                let levels = self.positive_specs(&args, token, name)?;
                Ok(Expr::OrgScope {
                    selector: OrgSelector::Level { levels },
                    body,
                })
            }

            ScopeKind::OuGroup => {
                let names = self.string_specs(&args, token, name)?;
                Ok(Expr::OrgScope {
                    selector: OrgSelector::Group { names },
                    body,
                })
            }

            ScopeKind::OuDataSet => {
                let names = self.string_specs(&args, token, name)?;
                Ok(Expr::OrgScope {
                    selector: OrgSelector::DataSet { names },
                    body,
                })
            }
        }
    }

    /// Extract integer-literal specs (sign allowed)
    fn int_specs(&self, args: &[Expr], token: &Token, name: &str) -> Result<Vec<i32>> {
        args.iter()
            .map(|arg| {
                int_literal(arg).ok_or_else(|| {
                    self.error_at(
                        token,
                        format!("{}() shift amounts must be integer literals", name),
                    )
                })
            })
            .collect()
    }

    /// Extract positive integer-literal specs
    fn positive_specs(&self, args: &[Expr], token: &Token, name: &str) -> Result<Vec<u32>> {
        args.iter()
            .map(|arg| {
                int_literal(arg)
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        self.error_at(
                            token,
                            format!("{}() expects positive integer literals", name),
                        )
                    })
            })
            .collect()
    }

    /// Extract exactly one positive integer-literal spec
    fn single_positive_spec(&self, args: &[Expr], token: &Token, name: &str) -> Result<u32> {
        if args.len() != 1 {
            return Err(self.error_at(
                token,
                format!("{}() expects one integer and a sub-expression", name),
            ));
        }
        self.positive_specs(args, token, name).map(|v| v[0])
    }

    /// Extract string-literal specs
    fn string_specs(&self, args: &[Expr], token: &Token, name: &str) -> Result<Vec<String>> {
        args.iter()
            .map(|arg| match arg {
                Expr::Text(s) => Ok(s.clone()),
                _ => Err(self.error_at(
                    token,
                    format!("{}() expects quoted group/dataset names", name),
                )),
            })
            .collect()
    }

    fn current(&self) -> &Token {
        &self.tokens[self.position]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current().kind, TokenKind::Eof)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.position += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected {}, found '{}'",
                what,
                if self.is_at_end() {
                    "end of expression"
                } else {
                    &self.current().span.text
                }
            )))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ExpressionError {
        let pos = &self.current().span.start;
        ExpressionError::syntax(pos.line, pos.column, message)
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> ExpressionError {
        ExpressionError::syntax(token.span.start.line, token.span.start.column, message)
    }
}

/// Match an integer literal, with optional leading minus
fn int_literal(expr: &Expr) -> Option<i32> {
    match expr {
        Expr::Number(n) if n.fract() == 0.0 => i32::try_from(*n as i64).ok(),
        Expr::Unary {
            op: UnaryOperator::Negate,
            operand,
        } => match operand.as_ref() {
            Expr::Number(n) if n.fract() == 0.0 => i32::try_from(-(*n as i64)).ok(),
            _ => None,
        },
        _ => None,
    }
}

/// Group two-or-more period shift specs into windows of four.
///
/// A short final chunk fills in: the "to" of a pair defaults to its "from",
/// and a missing year pair defaults to zero.
fn chunk_windows(shifts: &[i32]) -> Vec<PeriodWindow> {
    shifts
        .chunks(4)
        .map(|chunk| match *chunk {
            [p] => PeriodWindow {
                period_from: p,
                period_to: p,
                year_from: 0,
                year_to: 0,
            },
            [pf, pt] => PeriodWindow {
                period_from: pf,
                period_to: pt,
                year_from: 0,
                year_to: 0,
            },
            [pf, pt, yf] => PeriodWindow {
                period_from: pf,
                period_to: pt,
                year_from: yf,
                year_to: yf,
            },
            [pf, pt, yf, yt] => PeriodWindow {
                period_from: pf,
                period_to: pt,
                year_from: yf,
                year_to: yt,
            },
            _ => unreachable!("chunks(4) yields one to four elements"),
        })
        .collect()
}

/// Parse expression text using the token-based parser
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = crate::lexer::tokenize(source)?;
    let mut parser = TokenParser::new(tokens);
    parser.parse_expression_tree()
}
