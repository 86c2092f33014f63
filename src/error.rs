//! Error types and terminal formatting for adex
//!
//! One error enum covers the whole engine so callers can tell a user-facing
//! syntax problem apart from a data or engine problem. The colored renderer
//! is only used by the CLI; library callers get plain `Display` strings.

use colored::Colorize;
use pest::error::{Error as PestError, LineColLocation};
use thiserror::Error;

use crate::lexer::Rule;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ExpressionError>;

/// All failure categories of the expression engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// Malformed token or grammar, reported with source position
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// Wrong runtime type at an operator site
    #[error("type error: {0}")]
    Type(String),

    /// Constant, group, dataset, item or period that no collaborator knows
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// Illegal combination of container-producing functions
    #[error("invalid composition: {0}")]
    InvalidComposition(String),

    /// Engine invariant breach; never a user-facing validation message
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExpressionError {
    /// Build a syntax error at a known position
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        ExpressionError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    /// True for the one category the lenient description path may swallow
    pub fn is_syntax(&self) -> bool {
        matches!(self, ExpressionError::Syntax { .. })
    }
}

impl From<PestError<Rule>> for ExpressionError {
    fn from(error: PestError<Rule>) -> Self {
        let (line, column) = match error.line_col {
            LineColLocation::Pos((line, col)) => (line, col),
            LineColLocation::Span((line, col), _) => (line, col),
        };

        ExpressionError::Syntax {
            line,
            column,
            message: error.variant.message().to_string(),
        }
    }
}

/// Render an error with context and helpful information for terminal output
pub fn render_error(error: &ExpressionError, input: &str) -> String {
    let mut output = String::new();

    let (line, col) = match error {
        ExpressionError::Syntax { line, column, .. } => (*line, *column),
        _ => {
            // Non-syntax errors carry no position; header only
            output.push_str(&format!("{} {}\n", "Error:".red().bold(), error));
            return output;
        }
    };

    // Error header
    output.push_str(&format!("{} {}\n", "Syntax error:".red().bold(), error));

    // Location information
    output.push_str(&format!(
        "  {} {}:{}\n",
        "-->".blue().bold(),
        "expression".dimmed(),
        format!("{}:{}", line, col).cyan()
    ));

    // Show the problematic line with a caret under the offending column
    let lines: Vec<&str> = input.lines().collect();
    if line > 0 && line <= lines.len() {
        let line_idx = line - 1;

        output.push_str(&format!("   {}\n", "|".blue()));
        output.push_str(&format!(
            " {} | {}\n",
            format!("{:3}", line).blue().bold(),
            lines[line_idx]
        ));

        let indicator = format!("{}^", " ".repeat(col.saturating_sub(1)));
        output.push_str(&format!("   {} {}\n", "|".blue(), indicator.red().bold()));
    }

    output.push_str(&get_error_hint(lines.get(line.saturating_sub(1))));

    output
}

/// Get a helpful hint based on the offending source line
fn get_error_hint(line: Option<&&str>) -> String {
    if let Some(line_text) = line {
        let line = line_text.trim();

        if line.contains("==") {
            return format!(
                "\n  {} Equality is written '=', not '=='\n",
                "Hint:".yellow().bold()
            );
        }

        if line.contains("!=") {
            return format!(
                "\n  {} Inequality is written '<>', not '!='\n",
                "Hint:".yellow().bold()
            );
        }

        if line.matches('{').count() > line.matches('}').count() {
            return format!(
                "\n  {} Missing closing brace '}}' for a data reference\n",
                "Hint:".yellow().bold()
            );
        }

        if line.matches('(').count() > line.matches(')').count() {
            return format!(
                "\n  {} Missing closing parenthesis ')'\n",
                "Hint:".yellow().bold()
            );
        }
    }

    String::new()
}
