//! The four-stage column lineage pipeline: catalog loading, reference
//! resolution, star expansion, and lineage tracing.
//!
//! Each stage consumes the previous stage's output and produces a new,
//! immutable value; the only shared state across stages is the append-only
//! [`DiagnosticSink`]. [`run_pipeline`] wires the stages together for every
//! model the catalog loader surfaces.

pub mod catalog;
pub mod expander;
pub mod resolver;
pub mod tracer;

use crate::types::{Diagnostic, DiagnosticKind, DiagnosticSink, Dialect, LineageRow, ModelRecord};

/// Runs the full pipeline over a manifest + catalog document pair, producing
/// every model's `LineageRow`s alongside the diagnostics collected along the
/// way. Sources (which carry no `raw_sql`) pass through the loader but are
/// not traced — they have no transformation to derive lineage from.
pub fn run_pipeline(
    manifest_json: &str,
    catalog_json: &str,
    dialect: Dialect,
) -> (Vec<LineageRow>, DiagnosticSink) {
    let mut sink = DiagnosticSink::new();
    let records = catalog::load_catalog(manifest_json, catalog_json, &mut sink);
    #[cfg(feature = "tracing")]
    tracing::debug!(model_count = records.len(), "catalog loaded");

    let mut rows = Vec::new();
    for (model, reference_map) in &records {
        if model.raw_sql.trim().is_empty() {
            continue;
        }
        rows.extend(trace_model(model, reference_map, dialect, &mut sink));
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        row_count = rows.len(),
        diagnostic_count = sink.len(),
        "pipeline finished"
    );

    (rows, sink)
}

/// Runs stages 2-4 for a single already-loaded model. Exposed separately
/// from [`run_pipeline`] so callers that already have `ModelRecord`s (e.g.
/// tests, or a caller re-running a single changed model) don't need to
/// round-trip through JSON.
pub fn trace_model(
    model: &ModelRecord,
    reference_map: &crate::types::ReferenceMap,
    dialect: Dialect,
    sink: &mut DiagnosticSink,
) -> Vec<LineageRow> {
    let resolved = resolver::resolve_references(&model.raw_sql, reference_map, sink);
    let expanded = expander::expand_stars(&resolved, dialect, reference_map, sink);
    tracer::trace_lineage(&expanded, &model.raw_sql, dialect, model, reference_map, sink)
}

/// Looks up the catalog description for `column_name` on `model`, used when
/// flattening a `LineageRow` into the table-shaped `OutputRow`.
pub fn column_description<'a>(model: &'a ModelRecord, column_name: &str) -> &'a str {
    model
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(column_name))
        .map(|c| c.description.as_str())
        .unwrap_or_default()
}
