//! Stage 1: catalog loader.
//!
//! Joins a manifest document (symbolic dependencies + raw SQL per node) with
//! a catalog document (materialized schemas per node) into a flat set of
//! `ModelRecord`s, each paired with the `ReferenceMap` built from its
//! `depends_on` list.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::types::{ColumnRecord, Diagnostic, DiagnosticKind, DiagnosticSink, ModelRecord, ReferenceMap, ResourceType};

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    nodes: HashMap<String, ManifestNode>,
}

#[derive(Debug, Deserialize)]
struct ManifestNode {
    #[serde(default)]
    database: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    resource_type: String,
    #[serde(default)]
    raw_code: String,
    #[serde(default)]
    depends_on: DependsOn,
}

#[derive(Debug, Default, Deserialize)]
struct DependsOn {
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    nodes: HashMap<String, CatalogEntry>,
    #[serde(default)]
    sources: HashMap<String, CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    metadata: CatalogMetadata,
    #[serde(default)]
    name: String,
    /// Declaration order matters: it determines star-expansion / `CteScope`
    /// output order downstream, so this must not be a `HashMap`.
    #[serde(default)]
    columns: IndexMap<String, CatalogColumn>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogMetadata {
    #[serde(default)]
    database: String,
    #[serde(default)]
    schema: String,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogColumn {
    #[serde(default)]
    description: String,
}

/// A dep-key split into its resource kind and constituent parts, e.g.
/// `model.jaffle_shop.stg_products` or `source.jaffle_shop.ecom.raw_products`.
/// `name` is the dep-key's own trailing segment (`stg_products`,
/// `raw_products`), used as the fallback table name when the dep's catalog
/// entry omits `name` — never the current model's own name.
enum DepKey<'a> {
    Model { dep_key: &'a str, name: &'a str },
    Source { dep_key: &'a str, name: &'a str },
}

fn classify_dep_key(dep: &str) -> Result<DepKey<'_>, String> {
    let parts: Vec<&str> = dep.split('.').collect();
    match parts.first().copied() {
        Some("model") if parts.len() == 3 => Ok(DepKey::Model {
            dep_key: dep,
            name: parts[2],
        }),
        Some("source") if parts.len() == 4 => Ok(DepKey::Source {
            dep_key: dep,
            name: parts[3],
        }),
        Some(other) => Err(format!(
            "dependency key '{dep}' has unexpected resource kind '{other}' or wrong segment count"
        )),
        None => Err("empty dependency key".to_string()),
    }
}

fn catalog_entry_full_name(entry: &CatalogEntry, fallback_database: &str, fallback_schema: &str, fallback_table: &str) -> String {
    let database = if entry.metadata.database.is_empty() {
        fallback_database
    } else {
        &entry.metadata.database
    };
    let schema = if entry.metadata.schema.is_empty() {
        fallback_schema
    } else {
        &entry.metadata.schema
    };
    let table = if entry.name.is_empty() {
        fallback_table
    } else {
        &entry.name
    };
    format!("{database}.{schema}.{table}")
}

/// Loads and joins manifest + catalog JSON, producing one `(ModelRecord,
/// ReferenceMap)` pair per surviving manifest node. Every skip (unsupported
/// resource type, missing catalog entry, empty columns, malformed or
/// unresolved dependency) is recorded on `sink` rather than aborting the load.
pub fn load_catalog(
    manifest_json: &str,
    catalog_json: &str,
    sink: &mut DiagnosticSink,
) -> Vec<(ModelRecord, ReferenceMap)> {
    let manifest: ManifestDocument = match serde_json::from_str(manifest_json) {
        Ok(doc) => doc,
        Err(err) => {
            sink.push(Diagnostic::error(
                DiagnosticKind::ParseFailure,
                format!("failed to parse manifest JSON: {err}"),
            ));
            return Vec::new();
        }
    };

    let catalog: CatalogDocument = match serde_json::from_str(catalog_json) {
        Ok(doc) => doc,
        Err(err) => {
            sink.push(Diagnostic::error(
                DiagnosticKind::ParseFailure,
                format!("failed to parse catalog JSON: {err}"),
            ));
            return Vec::new();
        }
    };

    let mut records = Vec::new();

    for (node_key, node) in &manifest.nodes {
        let resource_type = match ResourceType::parse(&node.resource_type) {
            Some(rt) => rt,
            None => {
                sink.push(
                    Diagnostic::new(
                        DiagnosticKind::UnsupportedResourceType,
                        format!("node '{node_key}' has unsupported resource_type '{}'", node.resource_type),
                    )
                    .with_context(node_key.clone()),
                );
                continue;
            }
        };

        let catalog_entry = match resource_type {
            ResourceType::Model => catalog.nodes.get(node_key),
            ResourceType::Source => catalog.sources.get(node_key),
        };
        let catalog_entry = match catalog_entry {
            Some(entry) => entry,
            None => {
                sink.push(
                    Diagnostic::new(
                        DiagnosticKind::MissingCatalogEntry,
                        format!("no catalog entry found for node '{node_key}'"),
                    )
                    .with_context(node_key.clone()),
                );
                continue;
            }
        };

        if catalog_entry.columns.is_empty() {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::MissingCatalogEntry,
                    format!("no columns found for node '{node_key}' in catalog"),
                )
                .with_context(node_key.clone()),
            );
            continue;
        }

        let columns: Vec<ColumnRecord> = catalog_entry
            .columns
            .iter()
            .map(|(name, info)| ColumnRecord {
                name: name.clone(),
                description: info.description.clone(),
            })
            .collect();

        let mut reference_map = ReferenceMap::new();
        for dep in &node.depends_on.nodes {
            let classified = match classify_dep_key(dep) {
                Ok(c) => c,
                Err(reason) => {
                    sink.push(
                        Diagnostic::new(DiagnosticKind::MalformedDependencyKey, reason)
                            .with_context(dep.clone()),
                    );
                    continue;
                }
            };

            let (dep_key, dep_name, dep_entry) = match classified {
                DepKey::Model { dep_key, name } => (dep_key, name, catalog.nodes.get(dep_key)),
                DepKey::Source { dep_key, name } => (dep_key, name, catalog.sources.get(dep_key)),
            };
            let dep_entry = match dep_entry {
                Some(entry) => entry,
                None => {
                    sink.push(
                        Diagnostic::new(
                            DiagnosticKind::MissingCatalogEntry,
                            format!("no catalog entry found for dependency '{dep_key}'"),
                        )
                        .with_context(dep_key.to_string()),
                    );
                    continue;
                }
            };

            if dep_entry.columns.is_empty() {
                sink.push(
                    Diagnostic::new(
                        DiagnosticKind::MissingCatalogEntry,
                        format!("no columns found for dependency '{dep_key}'"),
                    )
                    .with_context(dep_key.to_string()),
                );
                continue;
            }

            let dep_full_name =
                catalog_entry_full_name(dep_entry, &node.database, &node.schema, dep_name);
            let dep_columns: Vec<String> = dep_entry.columns.keys().cloned().collect();
            reference_map.insert(dep_full_name, dep_columns);
        }

        let record = ModelRecord {
            database: node.database.clone(),
            schema: node.schema.clone(),
            table: node.name.clone(),
            resource_type,
            raw_sql: node.raw_code.clone(),
            columns,
            dependencies: node.depends_on.nodes.clone(),
        };

        records.push((record, reference_map));
    }

    records
}
