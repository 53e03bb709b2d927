//! Stage 3: star expander.
//!
//! Parses resolved SQL, walks each CTE in declaration order computing the
//! column list it exposes, and rewrites every bare `*` / `T.*` projection
//! into the concrete column list. The outermost `SELECT` is expanded last,
//! against the last declared CTE's scope rather than its own `FROM` target
//! (the common shape is an unaliased `select * from final`, where the two
//! coincide; kept deliberate rather than "fixed" since real manifests are
//! built against this behavior).

use std::collections::HashMap;

use sqlparser::ast::{Cte, Expr, Ident, Select, SelectItem, SetExpr, Statement, TableFactor};

use crate::parser::parse_sql_with_dialect;
use crate::types::{Dialect, Diagnostic, DiagnosticKind, DiagnosticSink, ReferenceMap};

/// Column list exposed by each CTE, built up in declaration order. Per-query,
/// ephemeral: dropped once expansion of a statement completes.
#[derive(Debug, Default, Clone)]
pub struct CteScope {
    order: Vec<String>,
    columns: HashMap<String, Vec<String>>,
}

impl CteScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, columns: Vec<String>) {
        let name = name.into();
        if !self.columns.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.columns.insert(name, columns);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.columns
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn last(&self) -> Option<(&str, &[String])> {
        self.order
            .last()
            .map(|name| (name.as_str(), self.columns[name].as_slice()))
    }
}

/// Parses `resolved_sql` and returns the pretty-printed, upper-cased
/// serialization of the AST with every star projection expanded. On parse
/// failure or a missing `WITH` clause, the SQL is returned unchanged and a
/// diagnostic is recorded.
pub fn expand_stars(
    resolved_sql: &str,
    dialect: Dialect,
    reference_map: &ReferenceMap,
    sink: &mut DiagnosticSink,
) -> String {
    let statements = match parse_sql_with_dialect(resolved_sql, dialect) {
        Ok(stmts) => stmts,
        Err(err) => {
            sink.push(Diagnostic::error(
                DiagnosticKind::ParseFailure,
                err.to_string(),
            ));
            return resolved_sql.to_string();
        }
    };

    let Some(Statement::Query(mut query)) = statements.into_iter().next() else {
        sink.push(Diagnostic::error(
            DiagnosticKind::ParseFailure,
            "expected a single query statement",
        ));
        return resolved_sql.to_string();
    };

    let mut with = match query.with.take() {
        Some(with) if !with.cte_tables.is_empty() => with,
        _ => {
            sink.push(Diagnostic::new(
                DiagnosticKind::NoWithClause,
                "query has no WITH clause; star expansion skipped",
            ));
            return resolved_sql.to_string();
        }
    };

    let mut scope = CteScope::new();
    for cte in with.cte_tables.iter_mut() {
        expand_cte(cte, &mut scope, reference_map, sink);
    }
    query.with = Some(with);

    if let SetExpr::Select(select) = query.body.as_mut() {
        if let Some((_, last_scope_columns)) = scope.last() {
            let last_scope_columns = last_scope_columns.to_vec();
            expand_select_projection(select, &last_scope_columns, &scope, sink);
        }
    }

    Statement::Query(query).to_string().to_uppercase()
}

fn expand_cte(cte: &mut Cte, scope: &mut CteScope, reference_map: &ReferenceMap, sink: &mut DiagnosticSink) {
    let cte_name = cte.alias.name.value.clone();
    let source_columns = resolve_cte_source_columns(cte, scope, reference_map, sink, &cte_name);

    match cte.query.body.as_mut() {
        SetExpr::Select(select) => {
            if let Some(columns) = &source_columns {
                expand_select_projection(select, columns, scope, sink);
            }
            let output_columns = output_column_names(select);
            scope.insert(cte_name, output_columns);
        }
        _ => {
            scope.insert(cte_name, Vec::new());
        }
    }
}

/// Determines `source_columns(S)` for a CTE's `FROM` target `S`.
fn resolve_cte_source_columns(
    cte: &Cte,
    scope: &CteScope,
    reference_map: &ReferenceMap,
    sink: &mut DiagnosticSink,
    cte_name: &str,
) -> Option<Vec<String>> {
    let select = match cte.query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnsupportedFromShape,
                    format!("CTE '{cte_name}' body is not a plain SELECT"),
                )
                .with_context(cte_name.to_string()),
            );
            return None;
        }
    };

    let table_with_joins = match select.from.as_slice() {
        [single] if single.joins.is_empty() => single,
        [] => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnknownSource,
                    format!("CTE '{cte_name}' has no FROM clause"),
                )
                .with_context(cte_name.to_string()),
            );
            return None;
        }
        _ => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnsupportedFromShape,
                    format!("CTE '{cte_name}' has a join or multi-source FROM"),
                )
                .with_context(cte_name.to_string()),
            );
            return None;
        }
    };

    let source_name = match &table_with_joins.relation {
        TableFactor::Table { name, .. } => name.to_string(),
        _ => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnsupportedFromShape,
                    format!("CTE '{cte_name}' FROM target is not a plain table reference"),
                )
                .with_context(cte_name.to_string()),
            );
            return None;
        }
    };

    if let Some(columns) = reference_map_lookup_ci(reference_map, &source_name) {
        return Some(columns.to_vec());
    }
    if let Some(columns) = scope.get(&source_name) {
        return Some(columns.to_vec());
    }

    sink.push(
        Diagnostic::new(
            DiagnosticKind::UnknownSource,
            format!("CTE '{cte_name}' references unknown source '{source_name}'"),
        )
        .with_context(cte_name.to_string()),
    );
    None
}

fn reference_map_lookup_ci<'a>(reference_map: &'a ReferenceMap, name: &str) -> Option<&'a [String]> {
    reference_map
        .iter()
        .find(|(full_name, _)| full_name.eq_ignore_ascii_case(name))
        .map(|(_, cols)| cols)
}

fn expand_select_projection(
    select: &mut Select,
    source_columns: &[String],
    scope: &CteScope,
    _sink: &mut DiagnosticSink,
) {
    let mut rewritten = Vec::with_capacity(select.projection.len());
    for item in select.projection.drain(..) {
        match item {
            SelectItem::Wildcard(_) => {
                for col in source_columns {
                    rewritten.push(SelectItem::UnnamedExpr(Expr::Identifier(Ident::new(
                        col.clone(),
                    ))));
                }
            }
            SelectItem::QualifiedWildcard(name, _) => {
                let table = name.to_string();
                if let Some(columns) = scope.get(&table) {
                    for col in columns {
                        rewritten.push(SelectItem::UnnamedExpr(Expr::CompoundIdentifier(vec![
                            Ident::new(table.clone()),
                            Ident::new(col.clone()),
                        ])));
                    }
                } else {
                    rewritten.push(SelectItem::QualifiedWildcard(name, Default::default()));
                }
            }
            other => rewritten.push(other),
        }
    }
    select.projection = rewritten;
}

fn output_column_names(select: &Select) -> Vec<String> {
    select
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => ident.value.clone(),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => parts
                .last()
                .map(|ident| ident.value.clone())
                .unwrap_or_default(),
            SelectItem::UnnamedExpr(expr) => expr.to_string(),
            SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
            SelectItem::Wildcard(_) => "*".to_string(),
            SelectItem::QualifiedWildcard(name, _) => format!("{name}.*"),
        })
        .collect()
}
