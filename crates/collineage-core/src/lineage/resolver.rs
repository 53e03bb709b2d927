//! Stage 2: reference resolver.
//!
//! Rewrites `{{ ref('name') }}` and `{{ source('src', 'name') }}` tokens in
//! raw model SQL into the fully-qualified name drawn from the model's
//! `ReferenceMap`, matching on the trailing `.table` segment.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{Diagnostic, DiagnosticKind, DiagnosticSink, ReferenceMap};

fn ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*ref\('([^']+)'\)\s*\}\}").expect("valid regex"))
}

fn source_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*source\('([^']+)'\s*,\s*'([^']+)'\)\s*\}\}").expect("valid regex")
    })
}

/// Replaces every `ref`/`source` token in `raw_sql` with the fully-qualified
/// name the `ReferenceMap` resolves it to. Unmatched tokens are left verbatim
/// and reported; the first matching candidate wins when more than one
/// `full_name` shares the same trailing table segment, with ambiguity
/// reported but not treated as fatal.
pub fn resolve_references(raw_sql: &str, reference_map: &ReferenceMap, sink: &mut DiagnosticSink) -> String {
    let after_refs = ref_regex().replace_all(raw_sql, |caps: &regex::Captures| {
        let ref_name = &caps[1];
        resolve_token(ref_name, reference_map, sink, &caps[0])
    });

    source_regex()
        .replace_all(&after_refs, |caps: &regex::Captures| {
            let table_name = &caps[2];
            resolve_token(table_name, reference_map, sink, &caps[0])
        })
        .into_owned()
}

fn resolve_token(
    trailing_name: &str,
    reference_map: &ReferenceMap,
    sink: &mut DiagnosticSink,
    original_token: &str,
) -> String {
    let candidates = reference_map.find_by_trailing_table(trailing_name);
    match candidates.as_slice() {
        [] => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedReference,
                    format!("no reference map entry matches '{trailing_name}'"),
                )
                .with_context(original_token.to_string()),
            );
            original_token.to_string()
        }
        [only] => only.to_string(),
        multiple => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedReference,
                    format!(
                        "'{trailing_name}' matches {} reference map entries; using the first",
                        multiple.len()
                    ),
                )
                .with_context(original_token.to_string()),
            );
            multiple[0].to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_ref_with_full_name() {
        let mut map = ReferenceMap::new();
        map.insert("analytics.staging.stg_customers", vec!["id".into()]);
        let mut sink = DiagnosticSink::new();
        let sql = resolve_references(
            "select * from {{ ref('stg_customers') }}",
            &map,
            &mut sink,
        );
        assert_eq!(sql, "select * from analytics.staging.stg_customers");
        assert!(sink.is_empty());
    }

    #[test]
    fn replaces_source_with_full_name() {
        let mut map = ReferenceMap::new();
        map.insert("raw.ecom.raw_customers", vec!["id".into()]);
        let mut sink = DiagnosticSink::new();
        let sql = resolve_references(
            "select id from {{ source('ecom', 'raw_customers') }}",
            &map,
            &mut sink,
        );
        assert_eq!(sql, "select id from raw.ecom.raw_customers");
    }

    #[test]
    fn leaves_unresolved_ref_verbatim_and_reports() {
        let map = ReferenceMap::new();
        let mut sink = DiagnosticSink::new();
        let sql = resolve_references("select * from {{ ref('missing') }}", &map, &mut sink);
        assert_eq!(sql, "select * from {{ ref('missing') }}");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.iter().next().unwrap().kind, DiagnosticKind::UnresolvedReference);
    }

    #[test]
    fn tolerates_whitespace_around_braces() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.t", vec![]);
        let mut sink = DiagnosticSink::new();
        let sql = resolve_references("{{   ref('t')   }}", &map, &mut sink);
        assert_eq!(sql, "db.sch.t");
    }

    #[test]
    fn ambiguous_match_uses_first_and_reports() {
        let mut map = ReferenceMap::new();
        map.insert("db.a.orders", vec![]);
        map.insert("db.b.orders", vec![]);
        let mut sink = DiagnosticSink::new();
        let sql = resolve_references("select * from {{ ref('orders') }}", &map, &mut sink);
        assert_eq!(sql, "select * from db.a.orders");
        assert_eq!(sink.len(), 1);
    }
}
