//! The tracer's output record.

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::catalog::ResourceType;

/// Sentinel used in `source_tables`/`source_columns`/`transformation` when a
/// projection could not be traced under the per-projection recovery policy.
pub const UNKNOWN_SENTINEL: &str = "Unknown";

/// One output column's lineage, emitted by the tracer. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LineageRow {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub resource_type: ResourceType,
    pub raw_sql: String,
    pub expanded_sql: String,
    /// The model's `ReferenceMap`, JSON-encoded as `{ full_name: [col, ...] }`.
    pub reference: String,
    pub final_column: String,
    pub source_tables: BTreeSet<String>,
    pub source_columns: BTreeSet<String>,
    pub transformation: String,
}

impl LineageRow {
    pub fn unique_key(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.database, self.schema, self.table, self.final_column
        )
    }

    /// A placeholder row for a projection that could not be traced. Every
    /// field that would normally carry a trace result is set to the
    /// `"Unknown"` sentinel.
    pub fn unknown(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        resource_type: ResourceType,
        raw_sql: impl Into<String>,
        expanded_sql: impl Into<String>,
        final_column: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
            resource_type,
            raw_sql: raw_sql.into(),
            expanded_sql: expanded_sql.into(),
            reference: String::new(),
            final_column: final_column.into(),
            source_tables: BTreeSet::from([UNKNOWN_SENTINEL.to_string()]),
            source_columns: BTreeSet::from([UNKNOWN_SENTINEL.to_string()]),
            transformation: reason.into(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.source_tables.len() == 1 && self.source_tables.contains(UNKNOWN_SENTINEL)
    }

    /// Flattens this row into the table-shaped output record, splitting
    /// `source_tables` into a joined `source_table` string plus
    /// `source_database`/`source_schema` when there is exactly one source
    /// table and it parses as `database.schema.table`.
    pub fn to_output_row(&self, column_description: impl Into<String>) -> OutputRow {
        let source_table = self.source_tables.iter().cloned().collect::<Vec<_>>().join(", ");
        let (source_database, source_schema) = match self.source_tables.len() {
            1 => {
                let only = self.source_tables.iter().next().unwrap();
                let parts: Vec<&str> = only.splitn(3, '.').collect();
                match parts.as_slice() {
                    [db, schema, _table] => (db.to_string(), schema.to_string()),
                    _ => (String::new(), String::new()),
                }
            }
            _ => (String::new(), String::new()),
        };

        OutputRow {
            unique_key: self.unique_key(),
            database: self.database.clone(),
            schema: self.schema.clone(),
            table: self.table.clone(),
            column: self.final_column.clone(),
            column_description: column_description.into(),
            resource_type: self.resource_type,
            raw_sql: self.raw_sql.clone(),
            expanded_sql: self.expanded_sql.clone(),
            reference: self.reference.clone(),
            final_column: self.final_column.clone(),
            source_table,
            source_database,
            source_schema,
            source_columns: self.source_columns.clone(),
            transformation: self.transformation.clone(),
        }
    }
}

/// The table-shaped lineage output record: one logical
/// row per output column, flattened for the downstream merge-with-reporting
/// step and for tabular export. Built from a `LineageRow` plus the column
/// description looked up from the owning model's catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputRow {
    pub unique_key: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub column: String,
    pub column_description: String,
    pub resource_type: ResourceType,
    pub raw_sql: String,
    pub expanded_sql: String,
    pub reference: String,
    pub final_column: String,
    pub source_table: String,
    pub source_database: String,
    pub source_schema: String,
    pub source_columns: BTreeSet<String>,
    pub transformation: String,
}
