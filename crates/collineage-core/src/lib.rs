//! Column-level lineage engine for a warehouse model graph.
//!
//! Given a manifest (symbolic dependencies + raw SQL per model) and a
//! catalog (materialized schemas per model), [`lineage::run_pipeline`] joins
//! the two, resolves `ref`/`source` placeholders, expands `*` projections
//! CTE-by-CTE, and traces each output column back to the base-table
//! expression that derives it.

pub mod error;
pub mod lineage;
pub mod parser;
pub mod types;

pub use error::ParseError;
pub use lineage::{column_description, run_pipeline, trace_model};
pub use parser::{parse_sql, parse_sql_with_dialect};

pub use types::{
    diagnostic_codes, ColumnRecord, Diagnostic, DiagnosticKind, DiagnosticSink, Dialect,
    LineageRow, ModelKey, ModelRecord, OutputRow, ReferenceMap, ResourceType, Severity,
    UNKNOWN_SENTINEL,
};
