//! Catalog-side data model: the immutable facts the loader produces and every
//! downstream stage consumes.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ModelKey;

/// The kind of node a `ModelRecord` was built from. Anything else found in a
/// manifest is skipped at load time (see the loader's `UnsupportedResourceType`
/// diagnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Model,
    Source,
}

impl ResourceType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "model" => Some(Self::Model),
            "source" => Some(Self::Source),
            _ => None,
        }
    }
}

/// One column of a `ModelRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One model or source, joined from a manifest node and its matching catalog
/// entry. Built once by the loader and never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModelRecord {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub resource_type: ResourceType,
    /// Raw (unresolved) SQL text. Empty for sources, which have no transformation.
    #[serde(default)]
    pub raw_sql: String,
    pub columns: Vec<ColumnRecord>,
    /// The dep-keys this model declared in `depends_on.nodes`, verbatim.
    pub dependencies: Vec<String>,
}

impl ModelRecord {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.database, &self.schema, &self.table)
    }
}

/// Per-model symbolic-to-physical map: `full_name ("db.schema.table") → ordered
/// column names`. One `ReferenceMap` is built per model from its
/// `dependencies`, and is immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a `full_name → columns` entry. A `full_name` already present is
    /// left untouched (first write wins), mirroring the loader's skip-on-reencounter
    /// behavior for malformed duplicate dep-keys.
    pub fn insert(&mut self, full_name: impl Into<String>, columns: Vec<String>) {
        self.entries.entry(full_name.into()).or_insert(columns);
    }

    pub fn get(&self, full_name: &str) -> Option<&[String]> {
        self.entries.get(full_name).map(|v| v.as_slice())
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.entries.contains_key(full_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds every `full_name` whose trailing `.table` segment equals `table`,
    /// in key order (this map is a `BTreeMap`, so that's lexicographic, not
    /// insertion order). Used by the reference resolver's `ref`/`source`
    /// substitution, which matches on trailing segment and reports ambiguity
    /// when more than one candidate comes back.
    pub fn find_by_trailing_table(&self, table: &str) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|full_name| {
                full_name
                    .rsplit('.')
                    .next()
                    .map(|last| last.eq_ignore_ascii_case(table))
                    .unwrap_or(false)
            })
            .map(|s| s.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_trailing_table_matches_case_insensitively() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.raw_orders", vec!["id".into()]);
        assert_eq!(
            map.find_by_trailing_table("RAW_ORDERS"),
            vec!["db.sch.raw_orders"]
        );
    }

    #[test]
    fn find_by_trailing_table_reports_all_candidates() {
        let mut map = ReferenceMap::new();
        map.insert("db.a.orders", vec!["id".into()]);
        map.insert("db.b.orders", vec!["id".into()]);
        let mut hits = map.find_by_trailing_table("orders");
        hits.sort();
        assert_eq!(hits, vec!["db.a.orders", "db.b.orders"]);
    }

    #[test]
    fn insert_keeps_first_write() {
        let mut map = ReferenceMap::new();
        map.insert("db.a.t", vec!["x".into()]);
        map.insert("db.a.t", vec!["y".into()]);
        assert_eq!(map.get("db.a.t"), Some(&["x".to_string()][..]));
    }
}
