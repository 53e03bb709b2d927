//! Human-readable table output formatting.

use collineage_core::OutputRow;
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use std::fmt::Write;
use tabled::builder::Builder;
use tabled::settings::Style;

/// Formats lineage rows as a human-readable table, one row per output column.
pub fn format_table(rows: &[OutputRow], use_colors: bool) -> String {
    let colored = use_colors && std::io::stdout().is_terminal();
    let mut out = String::new();

    if rows.is_empty() {
        return "No lineage rows produced.\n".to_string();
    }

    let header = format!("{} column(s) traced", rows.len());
    if colored {
        writeln!(out, "{}", header.bold()).unwrap();
    } else {
        writeln!(out, "{header}").unwrap();
    }
    writeln!(out).unwrap();

    let mut builder = Builder::default();
    builder.push_record([
        "database",
        "schema",
        "table",
        "column",
        "source_table",
        "source_columns",
        "transformation",
    ]);
    for row in rows {
        let source_columns = row
            .source_columns
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        builder.push_record([
            row.database.as_str(),
            row.schema.as_str(),
            row.table.as_str(),
            row.column.as_str(),
            row.source_table.as_str(),
            source_columns.as_str(),
            row.transformation.as_str(),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    writeln!(out, "{table}").unwrap();

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use collineage_core::{run_pipeline, Dialect};

    fn sample_rows() -> Vec<OutputRow> {
        let manifest = r#"{
            "nodes": {
                "model.proj.customers": {
                    "database": "db", "schema": "public", "name": "customers",
                    "resource_type": "model",
                    "raw_code": "SELECT id AS customer_id FROM {{ ref('stg_customers') }}",
                    "depends_on": {"nodes": ["model.proj.stg_customers"]}
                },
                "model.proj.stg_customers": {
                    "database": "db", "schema": "staging", "name": "stg_customers",
                    "resource_type": "model", "raw_code": "", "depends_on": {"nodes": []}
                }
            }
        }"#;
        let catalog = r#"{
            "nodes": {
                "model.proj.customers": {"columns": {"customer_id": {"description": "pk"}}},
                "model.proj.stg_customers": {"columns": {"id": {"description": "pk"}}}
            },
            "sources": {}
        }"#;
        let (lineage_rows, _sink) = run_pipeline(manifest, catalog, Dialect::Generic);
        lineage_rows.iter().map(|r| r.to_output_row("")).collect()
    }

    #[test]
    fn test_format_table_basic() {
        let rows = sample_rows();
        let output = format_table(&rows, false);
        assert!(output.contains("column(s) traced"));
        assert!(output.contains("customer_id"));
    }

    #[test]
    fn test_format_table_empty() {
        let output = format_table(&[], false);
        assert_eq!(output, "No lineage rows produced.\n");
    }
}
