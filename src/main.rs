//! adex CLI - inspect, check, describe and evaluate aggregate data expressions
//!
//! Evaluation commands read their surrounding world (coordinates, tables,
//! hierarchy, metadata) from a JSON data file so expressions can be exercised
//! without a live backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::Level;

use adex::providers::{CalendarPeriods, OrgUnitTree, StaticMetadata};
use adex::{
    error::render_error, AggregationType, DimensionItem, EvalContext, EvaluationData,
    ExpressionEngine, ExpressionItem, OrgUnit, Period, ValueMap,
};

#[derive(Parser)]
#[command(name = "adex-cli")]
#[command(about = "Aggregate data expression engine - parse, check, describe and evaluate", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an expression and dump its tokens and tree
    Parse {
        /// Expression text
        expression: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check that an expression is well formed
    Check {
        /// Expression text
        expression: String,
    },

    /// Render a human-readable description of an expression
    Describe {
        /// Expression text
        expression: String,

        /// JSON data file carrying the metadata tables
        #[arg(short, long)]
        data: PathBuf,
    },

    /// List the data items an expression depends on
    Items {
        /// Expression text
        expression: String,

        /// JSON data file carrying coordinates and hierarchy
        #[arg(short, long)]
        data: PathBuf,
    },

    /// Evaluate an expression against a data file
    Eval {
        /// Expression text
        expression: String,

        /// JSON data file carrying coordinates, tables and values
        #[arg(short, long)]
        data: PathBuf,
    },
}

/// Everything an evaluation run reads from disk
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DataFile {
    org_unit: Option<String>,
    period: Option<String>,
    days: Option<f64>,
    constants: HashMap<String, f64>,
    org_unit_counts: HashMap<String, f64>,
    values: Vec<ValueEntry>,
    hierarchy: OrgUnitTree,
    metadata: StaticMetadata,
}

#[derive(Debug, serde::Deserialize)]
struct ValueEntry {
    org_unit: String,
    period: String,
    item: DimensionItem,
    #[serde(default)]
    aggregation: Option<AggregationType>,
    value: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    println!(
        "{}",
        format!("adex v{}", env!("CARGO_PKG_VERSION"))
            .bright_blue()
            .bold()
    );
    println!();

    let engine = ExpressionEngine::new();

    match cli.command {
        Commands::Parse { expression, format } => {
            println!("{} {}", "Parsing".cyan().bold(), expression);

            let expr = match adex::parse_str(&expression) {
                Ok(expr) => expr,
                Err(e) => {
                    eprintln!("{}", render_error(&e, &expression));
                    std::process::exit(1);
                }
            };

            println!("{}", "✓ Parse successful".green());
            println!();

            match format.as_str() {
                "json" => {
                    println!("{}", serde_json::to_string_pretty(&expr)?);
                }
                _ => {
                    let tokens = adex::lexer::tokenize(&expression)?;
                    println!("{}", "Tokens:".bold());
                    for token in &tokens {
                        println!("  {:?}", token.kind);
                    }
                    println!();
                    println!("{}", "AST:".bold());
                    println!("{:#?}", expr);
                }
            }
        }

        Commands::Check { expression } => {
            println!("{} {}", "Checking".cyan().bold(), expression);

            match engine.check(&expression) {
                Ok(()) => println!("{}", "✓ Expression is well formed".green()),
                Err(e) => {
                    eprintln!("{}", render_error(&e, &expression));
                    std::process::exit(1);
                }
            }
        }

        Commands::Describe { expression, data } => {
            let data = load_data(&data)?;

            match engine.describe(&expression, &data.metadata) {
                Ok(description) => {
                    println!("{}", "✓ Description".green());
                    println!("  {}", description);
                }
                Err(e) => {
                    eprintln!("{}", render_error(&e, &expression));
                    std::process::exit(1);
                }
            }
        }

        Commands::Items { expression, data } => {
            let data = load_data(&data)?;
            let values = build_values(&data);
            let context = build_context(&data);
            let evaluation = EvaluationData {
                values: &values,
                periods: &CalendarPeriods,
                org_units: &data.hierarchy,
                metadata: &data.metadata,
            };

            match engine.expression_items(&expression, &evaluation, &context) {
                Ok(items) => {
                    let mut lines: Vec<String> =
                        items.iter().map(ExpressionItem::to_string).collect();
                    lines.sort();
                    for line in &lines {
                        println!("  {}", line);
                    }
                    println!();
                    println!("{} {} item(s)", "✓".green().bold(), lines.len());
                }
                Err(e) => {
                    eprintln!("{}", render_error(&e, &expression));
                    std::process::exit(1);
                }
            }
        }

        Commands::Eval { expression, data } => {
            println!("{} {}", "Evaluating".cyan().bold(), expression);

            let data = load_data(&data)?;
            if data.org_unit.is_none() || data.period.is_none() {
                eprintln!(
                    "{} data file must bind org_unit and period for evaluation",
                    "✗".red().bold()
                );
                std::process::exit(1);
            }
            let values = build_values(&data);
            let context = build_context(&data);
            let evaluation = EvaluationData {
                values: &values,
                periods: &CalendarPeriods,
                org_units: &data.hierarchy,
                metadata: &data.metadata,
            };

            match engine.evaluate(&expression, &evaluation, &context) {
                Ok(result) => {
                    println!("{}", "✓ Evaluation successful".green());
                    println!();
                    println!("{} {}", "Result:".bold(), format_result(result));
                }
                Err(e) => {
                    eprintln!("{}", render_error(&e, &expression));
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn load_data(path: &Path) -> Result<DataFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read data file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse data file: {}", path.display()))
}

fn build_context(data: &DataFile) -> EvalContext {
    let mut context = EvalContext::unbound()
        .with_constants(data.constants.clone())
        .with_org_unit_counts(data.org_unit_counts.clone());
    context.org_unit = data.org_unit.clone().map(OrgUnit::new);
    context.period = data.period.clone().map(Period::new);
    if let Some(days) = data.days {
        context = context.with_days(days);
    }
    context
}

fn build_values(data: &DataFile) -> ValueMap {
    let mut values = ValueMap::new();
    for entry in &data.values {
        values.insert(
            ExpressionItem {
                org_unit: OrgUnit::new(entry.org_unit.clone()),
                period: Period::new(entry.period.clone()),
                item: entry.item.clone(),
                aggregation: entry.aggregation,
            },
            entry.value,
        );
    }
    values
}

/// Format a nullable numeric result for display
fn format_result(result: Option<f64>) -> String {
    match result {
        Some(number) => number.to_string(),
        None => "null".to_string(),
    }
}
