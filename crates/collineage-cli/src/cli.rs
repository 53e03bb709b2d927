//! CLI argument parsing using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// collineage - column-level SQL lineage engine for a warehouse model graph.
#[derive(Parser, Debug)]
#[command(name = "collineage")]
#[command(about = "Trace column lineage across a manifest + catalog pair", long_about = None)]
#[command(version)]
pub struct Args {
    /// Path to the manifest JSON (symbolic dependencies + raw SQL per model).
    #[arg(long, value_name = "FILE")]
    pub manifest: PathBuf,

    /// Path to the catalog JSON (materialized schema per model).
    #[arg(long, value_name = "FILE")]
    pub catalog: PathBuf,

    /// SQL dialect used to parse and pretty-print model SQL.
    #[arg(short, long, default_value = "generic", value_enum)]
    pub dialect: DialectArg,

    /// Output format.
    #[arg(short, long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Output file (defaults to stdout).
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Minify JSON output (no effect on table output).
    #[arg(long)]
    pub compact: bool,

    /// Suppress the diagnostic summary on stderr.
    #[arg(short, long)]
    pub quiet: bool,
}

/// SQL dialect options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    Generic,
    Postgres,
    Snowflake,
    Bigquery,
}

impl From<DialectArg> for collineage_core::Dialect {
    fn from(d: DialectArg) -> Self {
        match d {
            DialectArg::Generic => collineage_core::Dialect::Generic,
            DialectArg::Postgres => collineage_core::Dialect::Postgres,
            DialectArg::Snowflake => collineage_core::Dialect::Snowflake,
            DialectArg::Bigquery => collineage_core::Dialect::Bigquery,
        }
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table, one row per output column.
    Table,
    /// The flattened `OutputRow` record, as a JSON array.
    Json,
}
