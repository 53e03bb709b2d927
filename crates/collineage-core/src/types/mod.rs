//! Shared types for the lineage pipeline: diagnostics, catalog records, and
//! the final `LineageRow` output.

mod catalog;
mod common;
mod dialect;
mod lineage;

pub use catalog::{ColumnRecord, ModelRecord, ReferenceMap, ResourceType};
pub use common::{Diagnostic, DiagnosticKind, DiagnosticSink, ModelKey, Severity, diagnostic_codes};
pub use dialect::Dialect;
pub use lineage::{LineageRow, OutputRow, UNKNOWN_SENTINEL};
