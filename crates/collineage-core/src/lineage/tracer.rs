//! Stage 4: lineage tracer.
//!
//! Walks the AST of the expanded SQL and, for each projection of the
//! outermost `SELECT`, derives the set of source `(table, column)` pairs that
//! feed it and a rewritten transformation in which every intermediate CTE
//! reference has been inlined back to base-table expressions.
//!
//! The walk builds a `cte_definitions` map
//! once per query (AST subtrees, not plain names, unlike the star expander's
//! `CteScope`), and a fixed-point column tracer bounded by a visited-set and
//! a hard depth cap.

use std::collections::{BTreeSet, HashMap, HashSet};

use sqlparser::ast::{
    CaseWhen, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor,
};

use crate::parser::parse_sql_with_dialect;
use crate::types::{
    Diagnostic, DiagnosticKind, DiagnosticSink, Dialect, LineageRow, ModelRecord, ReferenceMap,
    ResourceType, UNKNOWN_SENTINEL,
};

/// Column reference resolution is bounded to 10 plies. This is a
/// local termination guarantee, not a tuning knob.
const MAX_TRACE_DEPTH: usize = 10;

const UNKNOWN_TABLE: &str = "unknown";
const CONSTANT_TABLE: &str = "constant";

#[derive(Debug, Clone)]
struct ColumnDefinition {
    source_columns: BTreeSet<String>,
    source_table: String,
    transformation: Expr,
}

/// One CTE's contribution to `cte_definitions`. `Failed` marks a CTE whose
/// own FROM shape could not be resolved (join, missing source, ...); tracing
/// into it surfaces `UnsupportedFromShape`/`UnknownSource` rather than silently
/// treating it as an empty base table.
#[derive(Debug, Clone)]
enum CteEntry {
    Resolved {
        columns: HashMap<String, ColumnDefinition>,
    },
    Failed(DiagnosticKind),
}

#[derive(Debug, Clone)]
enum TraceError {
    UnknownSource(String),
    UnsupportedFromShape(String),
    DepthExceeded,
    Internal(String),
}

impl TraceError {
    fn kind(&self) -> DiagnosticKind {
        match self {
            Self::UnknownSource(_) => DiagnosticKind::UnknownSource,
            Self::UnsupportedFromShape(_) => DiagnosticKind::UnsupportedFromShape,
            Self::DepthExceeded => DiagnosticKind::TraceDepthExceeded,
            Self::Internal(_) => DiagnosticKind::TraceInternal,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::UnknownSource(m) | Self::UnsupportedFromShape(m) | Self::Internal(m) => {
                m.clone()
            }
            Self::DepthExceeded => {
                format!("column reference chain exceeded depth cap of {MAX_TRACE_DEPTH}")
            }
        }
    }
}

/// Traces `expanded_sql` for `model`, emitting one `LineageRow` per
/// projection of the outermost `SELECT`. Parse failures skip the whole query
/// per-projection failures emit an `"Unknown"` placeholder row instead, so a
/// single bad column never blocks lineage for the rest of the model.
pub fn trace_lineage(
    expanded_sql: &str,
    raw_sql: &str,
    dialect: Dialect,
    model: &ModelRecord,
    reference_map: &ReferenceMap,
    sink: &mut DiagnosticSink,
) -> Vec<LineageRow> {
    let statements = match parse_sql_with_dialect(expanded_sql, dialect) {
        Ok(stmts) => stmts,
        Err(err) => {
            sink.push(Diagnostic::error(
                DiagnosticKind::ParseFailure,
                format!("tracer failed to parse expanded SQL: {err}"),
            ));
            return Vec::new();
        }
    };

    let Some(Statement::Query(query)) = statements.into_iter().next() else {
        sink.push(Diagnostic::error(
            DiagnosticKind::ParseFailure,
            "expected a single query statement",
        ));
        return Vec::new();
    };

    let reference_text = serde_json::to_string(reference_map).unwrap_or_default();
    let mut table_alias_map: HashMap<String, String> = HashMap::new();
    let cte_definitions = build_cte_definitions(&query, &mut table_alias_map, sink);

    let outer_select = match outermost_select(&query) {
        Some(select) => select,
        None => {
            sink.push(Diagnostic::error(
                DiagnosticKind::ParseFailure,
                "outermost statement is not a plain SELECT",
            ));
            return Vec::new();
        }
    };

    let outer_from = resolve_outer_from(outer_select, &mut table_alias_map);

    let mut rows = Vec::new();
    for item in &outer_select.projection {
        let mut visited = HashSet::new();
        let row = trace_projection(
            item,
            outer_from.as_deref(),
            &table_alias_map,
            &cte_definitions,
            &mut visited,
            model,
            raw_sql,
            expanded_sql,
            &reference_text,
            sink,
        );
        rows.extend(row);
    }

    rows
}

fn outermost_select(query: &Query) -> Option<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(inner) => outermost_select(inner),
        _ => None,
    }
}

fn resolve_outer_from(select: &Select, table_alias_map: &mut HashMap<String, String>) -> Option<String> {
    let table_with_joins = select.from.first()?;
    if let TableFactor::Table { name, alias, .. } = &table_with_joins.relation {
        let table_name = name.to_string();
        if let Some(alias) = alias {
            table_alias_map.insert(alias.name.value.to_lowercase(), table_name.clone());
        }
        table_alias_map
            .entry(table_name.to_lowercase())
            .or_insert_with(|| table_name.clone());
        Some(table_name)
    } else {
        None
    }
}

/// Builds `cte_definitions` by walking each CTE's projection list in
/// declaration order, mirroring the star expander's `CteScope` construction
/// but recording AST subtrees instead of plain column names.
fn build_cte_definitions(
    query: &Query,
    table_alias_map: &mut HashMap<String, String>,
    sink: &mut DiagnosticSink,
) -> HashMap<String, CteEntry> {
    let mut cte_definitions: HashMap<String, CteEntry> = HashMap::new();

    let Some(with) = &query.with else {
        return cte_definitions;
    };

    for cte in &with.cte_tables {
        let cte_name = cte.alias.name.value.clone();
        let cte_key = cte_name.to_lowercase();
        table_alias_map.insert(cte_key.clone(), cte_name.clone());

        let select = match cte.query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => {
                sink.push(
                    Diagnostic::new(
                        DiagnosticKind::UnsupportedFromShape,
                        format!("CTE '{cte_name}' body is not a plain SELECT"),
                    )
                    .with_context(cte_name.clone()),
                );
                cte_definitions.insert(cte_key, CteEntry::Failed(DiagnosticKind::UnsupportedFromShape));
                continue;
            }
        };

        let source_table = match resolve_cte_from(select, &cte_name, sink) {
            Ok(name) => name,
            Err(kind) => {
                cte_definitions.insert(cte_key, CteEntry::Failed(kind));
                continue;
            }
        };

        let mut local_alias_map = table_alias_map.clone();
        if let Some(single) = select.from.first() {
            if let TableFactor::Table { name, alias, .. } = &single.relation {
                if let Some(alias) = alias {
                    local_alias_map.insert(alias.name.value.to_lowercase(), name.to_string());
                }
            }
        }

        let mut columns = HashMap::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    let output_name = surface_name(expr);
                    let mut visited = HashSet::new();
                    match extract(
                        expr,
                        &local_alias_map,
                        &source_table,
                        &cte_definitions,
                        &mut visited,
                        0,
                    ) {
                        Ok((source_columns, transformation, table)) => {
                            columns.insert(
                                output_name.to_lowercase(),
                                ColumnDefinition {
                                    source_columns,
                                    source_table: table,
                                    transformation,
                                },
                            );
                        }
                        Err(err) => {
                            sink.push(
                                Diagnostic::new(err.kind(), err.message())
                                    .with_context(format!("{cte_name}.{output_name}")),
                            );
                        }
                    }
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let mut visited = HashSet::new();
                    match extract(
                        expr,
                        &local_alias_map,
                        &source_table,
                        &cte_definitions,
                        &mut visited,
                        0,
                    ) {
                        Ok((source_columns, transformation, table)) => {
                            columns.insert(
                                alias.value.to_lowercase(),
                                ColumnDefinition {
                                    source_columns,
                                    source_table: table,
                                    transformation,
                                },
                            );
                        }
                        Err(err) => {
                            sink.push(
                                Diagnostic::new(err.kind(), err.message())
                                    .with_context(format!("{cte_name}.{}", alias.value)),
                            );
                        }
                    }
                }
                // Stars should already have been rewritten by the expander; any
                // survivor here means expansion itself failed upstream.
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {}
            }
        }

        cte_definitions.insert(cte_key, CteEntry::Resolved { columns });
    }

    cte_definitions
}

fn resolve_cte_from(
    select: &Select,
    cte_name: &str,
    sink: &mut DiagnosticSink,
) -> Result<String, DiagnosticKind> {
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
            return Err(DiagnosticKind::UnknownSource);
        }
        _ => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnsupportedFromShape,
                    format!("CTE '{cte_name}' has a join or multi-source FROM"),
                )
                .with_context(cte_name.to_string()),
            );
            return Err(DiagnosticKind::UnsupportedFromShape);
        }
    };

    match &table_with_joins.relation {
        TableFactor::Table { name, .. } => Ok(name.to_string()),
        _ => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::UnsupportedFromShape,
                    format!("CTE '{cte_name}' FROM target is not a plain table reference"),
                )
                .with_context(cte_name.to_string()),
            );
            Err(DiagnosticKind::UnsupportedFromShape)
        }
    }
}

fn surface_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn trace_projection(
    item: &SelectItem,
    outer_from: Option<&str>,
    table_alias_map: &HashMap<String, String>,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    model: &ModelRecord,
    raw_sql: &str,
    expanded_sql: &str,
    reference_text: &str,
    sink: &mut DiagnosticSink,
) -> Vec<LineageRow> {
    let base_row = |final_column: &str, source_tables: BTreeSet<String>, source_columns: BTreeSet<String>, transformation: String| {
        LineageRow {
            database: model.database.clone(),
            schema: model.schema.clone(),
            table: model.table.clone(),
            resource_type: model.resource_type,
            raw_sql: raw_sql.to_string(),
            expanded_sql: expanded_sql.to_string(),
            reference: reference_text.to_string(),
            final_column: final_column.to_string(),
            source_tables,
            source_columns,
            transformation,
        }
    };

    let Some(outer_from) = outer_from else {
        let reason = "outer SELECT has no resolvable FROM target".to_string();
        sink.push(Diagnostic::error(DiagnosticKind::UnknownSource, reason.clone()));
        return vec![LineageRow::unknown(
            &model.database,
            &model.schema,
            &model.table,
            model.resource_type,
            raw_sql,
            expanded_sql,
            surface_name_of_item(item),
            reason,
        )];
    };

    match item {
        SelectItem::Wildcard(_) => match cte_definitions.get(&outer_from.to_lowercase()) {
            Some(CteEntry::Resolved { columns }) => {
                let mut names: Vec<&String> = columns.keys().collect();
                names.sort();
                names
                    .into_iter()
                    .map(|col| {
                        let mut local_visited = HashSet::new();
                        match trace_column_lineage(
                            col,
                            outer_from,
                            cte_definitions,
                            &mut local_visited,
                            0,
                        ) {
                            Ok((src_cols, src_table, transformation)) => base_row(
                                col,
                                split_tables(&src_table),
                                src_cols,
                                transformation.to_string(),
                            ),
                            Err(err) => {
                                sink.push(Diagnostic::new(err.kind(), err.message()).with_context(col.clone()));
                                LineageRow::unknown(
                                    &model.database,
                                    &model.schema,
                                    &model.table,
                                    model.resource_type,
                                    raw_sql,
                                    expanded_sql,
                                    col,
                                    err.message(),
                                )
                            }
                        }
                    })
                    .collect()
            }
            _ => {
                let reason = format!("cannot expand '*' against unresolved source '{outer_from}'");
                sink.push(Diagnostic::new(DiagnosticKind::UnknownSource, reason.clone()));
                vec![LineageRow::unknown(
                    &model.database,
                    &model.schema,
                    &model.table,
                    model.resource_type,
                    raw_sql,
                    expanded_sql,
                    "*",
                    reason,
                )]
            }
        },
        SelectItem::QualifiedWildcard(name, _) => {
            let reason = format!("unexpanded qualified wildcard '{name}.*' reached the tracer");
            sink.push(Diagnostic::new(DiagnosticKind::UnsupportedFromShape, reason.clone()));
            vec![LineageRow::unknown(
                &model.database,
                &model.schema,
                &model.table,
                model.resource_type,
                raw_sql,
                expanded_sql,
                format!("{name}.*"),
                reason,
            )]
        }
        SelectItem::ExprWithAlias { expr, alias } => {
            vec![trace_single_expr(
                expr,
                &alias.value,
                outer_from,
                table_alias_map,
                cte_definitions,
                visited,
                model,
                raw_sql,
                expanded_sql,
                reference_text,
                sink,
            )]
        }
        SelectItem::UnnamedExpr(expr) => {
            let final_column = surface_name(expr);
            vec![trace_single_expr(
                expr,
                &final_column,
                outer_from,
                table_alias_map,
                cte_definitions,
                visited,
                model,
                raw_sql,
                expanded_sql,
                reference_text,
                sink,
            )]
        }
    }
}

fn surface_name_of_item(item: &SelectItem) -> String {
    match item {
        SelectItem::UnnamedExpr(expr) => surface_name(expr),
        SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
        SelectItem::Wildcard(_) => "*".to_string(),
        SelectItem::QualifiedWildcard(name, _) => format!("{name}.*"),
    }
}

#[allow(clippy::too_many_arguments)]
fn trace_single_expr(
    expr: &Expr,
    final_column: &str,
    current_table: &str,
    table_alias_map: &HashMap<String, String>,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    model: &ModelRecord,
    raw_sql: &str,
    expanded_sql: &str,
    reference_text: &str,
    sink: &mut DiagnosticSink,
) -> LineageRow {
    match extract(expr, table_alias_map, current_table, cte_definitions, visited, 0) {
        Ok((source_columns, transformation, source_table)) => LineageRow {
            database: model.database.clone(),
            schema: model.schema.clone(),
            table: model.table.clone(),
            resource_type: model.resource_type,
            raw_sql: raw_sql.to_string(),
            expanded_sql: expanded_sql.to_string(),
            reference: reference_text.to_string(),
            final_column: final_column.to_string(),
            source_tables: split_tables(&source_table),
            source_columns,
            transformation: transformation.to_string(),
        },
        Err(err) => {
            sink.push(Diagnostic::new(err.kind(), err.message()).with_context(final_column.to_string()));
            LineageRow::unknown(
                &model.database,
                &model.schema,
                &model.table,
                model.resource_type,
                raw_sql,
                expanded_sql,
                final_column,
                err.message(),
            )
        }
    }
}

fn split_tables(joined: &str) -> BTreeSet<String> {
    if joined.is_empty() || joined == UNKNOWN_TABLE || joined == CONSTANT_TABLE {
        return BTreeSet::new();
    }
    joined.split(", ").map(|s| s.to_string()).collect()
}

/// The fixed-point walk: resolves `col` as exposed by
/// `table`, recursing through intermediate CTEs until a base table is
/// reached, bounded by a visited-set (cycle break) and a hard depth cap.
fn trace_column_lineage(
    col: &str,
    table: &str,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    depth: usize,
) -> Result<(BTreeSet<String>, String, Expr), TraceError> {
    let visit_key = (table.to_lowercase(), col.to_lowercase());
    if !visited.insert(visit_key.clone()) {
        return Ok((
            BTreeSet::from([col.to_string()]),
            table.to_string(),
            Expr::Identifier(Ident::new(col.to_string())),
        ));
    }

    if depth >= MAX_TRACE_DEPTH {
        return Err(TraceError::DepthExceeded);
    }

    let table_key = table.to_lowercase();
    let Some(entry) = cte_definitions.get(&table_key) else {
        // Not a CTE: `table` is a base table.
        return Ok((
            BTreeSet::from([col.to_string()]),
            table.to_string(),
            Expr::Identifier(Ident::new(col.to_string())),
        ));
    };

    let columns = match entry {
        CteEntry::Resolved { columns } => columns,
        CteEntry::Failed(kind) => {
            return Err(match kind {
                DiagnosticKind::UnknownSource => {
                    TraceError::UnknownSource(format!("'{table}' has no resolvable source"))
                }
                _ => TraceError::UnsupportedFromShape(format!(
                    "'{table}' has an unsupported FROM shape"
                )),
            });
        }
    };

    let Some(def) = columns.get(&col.to_lowercase()) else {
        return Ok((
            BTreeSet::from([col.to_string()]),
            table.to_string(),
            Expr::Identifier(Ident::new(col.to_string())),
        ));
    };

    let ColumnDefinition {
        source_columns,
        source_table,
        transformation,
    } = def.clone();

    let mut rewrite_visited = visited.clone();
    let rewritten = rewrite_transformation(
        &transformation,
        &source_table,
        cte_definitions,
        &mut rewrite_visited,
        depth + 1,
    )?;

    let mut final_columns = BTreeSet::new();
    let mut final_tables: Vec<String> = Vec::new();
    for src_col in &source_columns {
        let (cols, tbls, _) =
            trace_column_lineage(src_col, &source_table, cte_definitions, visited, depth + 1)?;
        final_columns.extend(cols);
        for t in split_tables(&tbls) {
            if !final_tables.contains(&t) {
                final_tables.push(t);
            }
        }
    }

    Ok((final_columns, final_tables.join(", "), rewritten))
}

/// Substitutes every column reference inside `expr` with the traced result
/// of resolving it from `table`. This is what makes the emitted
/// transformation CTE-free: every leaf identifier bottoms out at a base
/// table column.
fn rewrite_transformation(
    expr: &Expr,
    table: &str,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    depth: usize,
) -> Result<Expr, TraceError> {
    let table_alias_map = HashMap::new();
    let (_, rewritten, _) = extract(expr, &table_alias_map, table, cte_definitions, visited, depth)?;
    Ok(rewritten)
}

/// Recursive descent over an expression, returning the source columns it
/// draws from, the rewritten (CTE-free) expression, and the joined set of
/// source tables.
fn extract(
    expr: &Expr,
    table_alias_map: &HashMap<String, String>,
    current_table: &str,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    depth: usize,
) -> Result<(BTreeSet<String>, Expr, String), TraceError> {
    match expr {
        Expr::Identifier(ident) => {
            let (cols, table, rewritten) = trace_column_lineage(
                &ident.value,
                current_table,
                cte_definitions,
                visited,
                depth,
            )?;
            Ok((cols, rewritten, table))
        }
        Expr::CompoundIdentifier(parts) => {
            let (qualifier, col) = match parts.as_slice() {
                [t, c] => (t.value.clone(), c.value.clone()),
                [.., c] => (current_table.to_string(), c.value.clone()),
                [] => return Ok((BTreeSet::new(), expr.clone(), current_table.to_string())),
            };
            let resolved_table = table_alias_map
                .get(&qualifier.to_lowercase())
                .cloned()
                .unwrap_or(qualifier);
            let (cols, table, rewritten) =
                trace_column_lineage(&col, &resolved_table, cte_definitions, visited, depth)?;
            Ok((cols, rewritten, table))
        }
        Expr::Value(_) | Expr::TypedString { .. } => {
            Ok((BTreeSet::new(), expr.clone(), CONSTANT_TABLE.to_string()))
        }
        Expr::Nested(inner) => {
            let (cols, rewritten, table) =
                extract(inner, table_alias_map, current_table, cte_definitions, visited, depth)?;
            Ok((cols, Expr::Nested(Box::new(rewritten)), table))
        }
        Expr::BinaryOp { left, op, right } => {
            let (mut cols, left_rw, left_table) =
                extract(left, table_alias_map, current_table, cte_definitions, visited, depth)?;
            let (right_cols, right_rw, right_table) =
                extract(right, table_alias_map, current_table, cte_definitions, visited, depth)?;
            cols.extend(right_cols);
            let table = join_tables(&[left_table, right_table], current_table);
            Ok((
                cols,
                Expr::BinaryOp {
                    left: Box::new(left_rw),
                    op: op.clone(),
                    right: Box::new(right_rw),
                },
                table,
            ))
        }
        Expr::UnaryOp { op, expr: inner } => {
            let (cols, rewritten, table) =
                extract(inner, table_alias_map, current_table, cte_definitions, visited, depth)?;
            Ok((
                cols,
                Expr::UnaryOp {
                    op: *op,
                    expr: Box::new(rewritten),
                },
                table,
            ))
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
        } => extract_case(
            operand.as_deref(),
            conditions,
            else_result.as_deref(),
            table_alias_map,
            current_table,
            cte_definitions,
            visited,
            depth,
        ),
        Expr::Cast {
            kind,
            expr: inner,
            data_type,
            format,
        } => {
            let (cols, rewritten, table) =
                extract(inner, table_alias_map, current_table, cte_definitions, visited, depth)?;
            Ok((
                cols,
                Expr::Cast {
                    kind: *kind,
                    expr: Box::new(rewritten),
                    data_type: data_type.clone(),
                    format: format.clone(),
                },
                table,
            ))
        }
        Expr::Function(function) => extract_function(
            function,
            table_alias_map,
            current_table,
            cte_definitions,
            visited,
            depth,
        ),
        // Conservative pass-through: anything not covered above is left
        // structurally untouched and attributed to the current table.
        other => Ok((BTreeSet::new(), other.clone(), current_table.to_string())),
    }
}

#[allow(clippy::too_many_arguments)]
fn extract_case(
    operand: Option<&Expr>,
    conditions: &[CaseWhen],
    else_result: Option<&Expr>,
    table_alias_map: &HashMap<String, String>,
    current_table: &str,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    depth: usize,
) -> Result<(BTreeSet<String>, Expr, String), TraceError> {
    let mut cols = BTreeSet::new();
    let mut tables = Vec::new();

    let operand_rw = match operand {
        Some(o) => {
            let (c, rw, t) = extract(o, table_alias_map, current_table, cte_definitions, visited, depth)?;
            cols.extend(c);
            tables.push(t);
            Some(Box::new(rw))
        }
        None => None,
    };

    let mut rewritten_conditions = Vec::with_capacity(conditions.len());
    for when in conditions {
        let (c_cols, c_rw, c_table) = extract(
            &when.condition,
            table_alias_map,
            current_table,
            cte_definitions,
            visited,
            depth,
        )?;
        let (r_cols, r_rw, r_table) = extract(
            &when.result,
            table_alias_map,
            current_table,
            cte_definitions,
            visited,
            depth,
        )?;
        cols.extend(c_cols);
        cols.extend(r_cols);
        tables.push(c_table);
        tables.push(r_table);
        rewritten_conditions.push(CaseWhen {
            condition: c_rw,
            result: r_rw,
        });
    }

    let else_rw = match else_result {
        Some(e) => {
            let (c, rw, t) = extract(e, table_alias_map, current_table, cte_definitions, visited, depth)?;
            cols.extend(c);
            tables.push(t);
            Some(Box::new(rw))
        }
        None => None,
    };

    let table = join_tables(&tables, current_table);
    Ok((
        cols,
        Expr::Case {
            operand: operand_rw,
            conditions: rewritten_conditions,
            else_result: else_rw,
        },
        table,
    ))
}

fn extract_function(
    function: &Function,
    table_alias_map: &HashMap<String, String>,
    current_table: &str,
    cte_definitions: &HashMap<String, CteEntry>,
    visited: &mut HashSet<(String, String)>,
    depth: usize,
) -> Result<(BTreeSet<String>, Expr, String), TraceError> {
    let FunctionArguments::List(list) = &function.args else {
        return Ok((
            BTreeSet::new(),
            Expr::Function(function.clone()),
            current_table.to_string(),
        ));
    };

    let mut cols = BTreeSet::new();
    let mut tables = Vec::new();
    let mut rewritten_args = Vec::with_capacity(list.args.len());

    for arg in &list.args {
        match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) => {
                let (c, rw, t) =
                    extract(inner, table_alias_map, current_table, cte_definitions, visited, depth)?;
                cols.extend(c);
                tables.push(t);
                rewritten_args.push(FunctionArg::Unnamed(FunctionArgExpr::Expr(rw)));
            }
            other => rewritten_args.push(other.clone()),
        }
    }

    let table = join_tables(&tables, current_table);
    let mut rewritten_function = function.clone();
    rewritten_function.args = FunctionArguments::List(sqlparser::ast::FunctionArgumentList {
        duplicate_treatment: list.duplicate_treatment,
        args: rewritten_args,
        clauses: list.clauses.clone(),
    });

    Ok((cols, Expr::Function(rewritten_function), table))
}

/// Joins non-empty, non-`unknown`/`constant` tables into a single
/// comma-separated set, falling back to `current_table` when nothing
/// survives the filter.
fn join_tables(tables: &[String], current_table: &str) -> String {
    let mut seen = Vec::new();
    for t in tables {
        if t == UNKNOWN_TABLE || t == CONSTANT_TABLE || t.is_empty() {
            continue;
        }
        for part in t.split(", ") {
            if !seen.iter().any(|s: &String| s == part) {
                seen.push(part.to_string());
            }
        }
    }
    if seen.is_empty() {
        current_table.to_string()
    } else {
        seen.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::resolver::resolve_references;
    use crate::lineage::expander::expand_stars;
    use crate::types::{ColumnRecord, DiagnosticSink};

    fn model(database: &str, schema: &str, table: &str, raw_sql: &str) -> ModelRecord {
        ModelRecord {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
            resource_type: ResourceType::Model,
            raw_sql: raw_sql.into(),
            columns: vec![ColumnRecord {
                name: "placeholder".into(),
                description: String::new(),
            }],
            dependencies: Vec::new(),
        }
    }

    fn run_pipeline(raw_sql: &str, map: &ReferenceMap, m: &ModelRecord) -> (Vec<LineageRow>, DiagnosticSink) {
        let mut sink = DiagnosticSink::new();
        let resolved = resolve_references(raw_sql, map, &mut sink);
        let expanded = expand_stars(&resolved, Dialect::Generic, map, &mut sink);
        let rows = trace_lineage(&expanded, raw_sql, Dialect::Generic, m, map, &mut sink);
        (rows, sink)
    }

    #[test]
    fn simple_rename_traces_to_base_column() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.raw", vec!["id".into()]);
        let m = model("db", "sch", "customers", "");
        let sql = "WITH a AS (SELECT id FROM db.sch.raw) SELECT id AS customer_id FROM a";
        let (rows, _sink) = run_pipeline(sql, &map, &m);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].final_column, "customer_id");
        assert_eq!(rows[0].source_tables, BTreeSet::from(["db.sch.raw".to_string()]));
        assert_eq!(rows[0].source_columns, BTreeSet::from(["id".to_string()]));
        assert!(rows[0].transformation.contains("ID"));
    }

    #[test]
    fn star_expansion_traces_every_expanded_column() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.raw", vec!["name".into(), "qty".into()]);
        let m = model("db", "sch", "widgets", "");
        let sql = "WITH a AS (SELECT * FROM db.sch.raw) SELECT * FROM a";
        let (rows, _sink) = run_pipeline(sql, &map, &m);
        let mut final_columns: Vec<_> = rows.iter().map(|r| r.final_column.clone()).collect();
        final_columns.sort();
        assert_eq!(final_columns, vec!["NAME".to_string(), "QTY".to_string()]);
        for row in &rows {
            assert_eq!(row.source_tables, BTreeSet::from(["db.sch.raw".to_string()]));
        }
    }

    #[test]
    fn arithmetic_unions_source_columns() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.orders", vec!["price".into(), "qty".into()]);
        let m = model("db", "sch", "revenue", "");
        let sql = "WITH a AS (SELECT price, qty FROM db.sch.orders) SELECT price * qty AS revenue FROM a";
        let (rows, _sink) = run_pipeline(sql, &map, &m);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].final_column, "revenue");
        assert_eq!(
            rows[0].source_columns,
            BTreeSet::from(["price".to_string(), "qty".to_string()])
        );
        assert!(rows[0].transformation.contains("PRICE"));
        assert!(rows[0].transformation.contains("QTY"));
    }

    #[test]
    fn join_from_in_cte_emits_unknown_placeholder() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.a", vec!["id".into()]);
        map.insert("db.sch.b", vec!["id".into()]);
        let m = model("db", "sch", "v", "");
        let sql = "WITH a AS (SELECT x.id FROM db.sch.a x JOIN db.sch.b y ON x.id = y.id) SELECT id FROM a";
        let (rows, sink) = run_pipeline(sql, &map, &m);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_unknown());
        assert!(sink
            .iter()
            .any(|d| d.kind == DiagnosticKind::UnsupportedFromShape));
    }

    #[test]
    fn aggregate_with_distinct_preserves_flag() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.raw", vec!["id".into()]);
        let m = model("db", "sch", "counts", "");
        let sql = "WITH a AS (SELECT id FROM db.sch.raw) SELECT COUNT(DISTINCT id) AS n FROM a";
        let (rows, _sink) = run_pipeline(sql, &map, &m);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].final_column, "n");
        assert_eq!(rows[0].source_columns, BTreeSet::from(["id".to_string()]));
        assert!(rows[0].transformation.to_uppercase().contains("DISTINCT"));
    }

    #[test]
    fn literal_projection_has_empty_source_columns() {
        let map = ReferenceMap::new();
        let m = model("db", "sch", "constant_row", "");
        let sql = "WITH a AS (SELECT 1 AS x) SELECT x FROM a";
        let (rows, _sink) = run_pipeline(sql, &map, &m);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].source_columns.is_empty());
        assert!(rows[0].source_tables.is_empty());
    }

    #[test]
    fn no_with_clause_traces_directly_to_outer_from() {
        let map = ReferenceMap::new();
        let m = model("db", "sch", "passthrough", "");
        let mut sink = DiagnosticSink::new();
        let sql = "SELECT id FROM db.sch.t";
        let rows = trace_lineage(sql, sql, Dialect::Generic, &m, &map, &mut sink);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].final_column, "id");
        assert_eq!(rows[0].source_tables, BTreeSet::from(["db.sch.t".to_string()]));
        assert_eq!(rows[0].source_columns, BTreeSet::from(["id".to_string()]));
    }

    #[test]
    fn long_rename_chain_hits_depth_cap() {
        // 12 CTEs forwarding the same column one hop at a time: each hop's
        // (table, col) visited-set key is distinct (the table name changes
        // every time), so the visited-set cycle breaker never fires and the
        // chain must be stopped by the MAX_TRACE_DEPTH cap instead.
        let mut map = ReferenceMap::new();
        map.insert("db.sch.raw", vec!["v".into()]);
        let m = model("db", "sch", "chained", "");
        let depth = 12;
        let mut ctes = String::new();
        for i in 0..depth {
            let from = if i == 0 {
                "db.sch.raw".to_string()
            } else {
                format!("c{}", i - 1)
            };
            ctes.push_str(&format!("c{i} AS (SELECT v FROM {from}), "));
        }
        ctes.truncate(ctes.len() - 2);
        let sql = format!("WITH {ctes} SELECT v FROM c{last}", last = depth - 1);
        let (rows, sink) = run_pipeline(&sql, &map, &m);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_unknown());
        assert!(sink
            .iter()
            .any(|d| d.kind == DiagnosticKind::TraceDepthExceeded));
    }

    #[test]
    fn mutual_forward_reference_terminates_without_panicking() {
        // c1's FROM target (c2) is declared after it, violating the
        // declaration-order invariant CTEs normally rely on. The tracer must
        // still terminate gracefully (via the visited-set cycle breaker)
        // rather than panicking or looping forever.
        let map = ReferenceMap::new();
        let m = model("db", "sch", "cyclical", "");
        let mut sink = DiagnosticSink::new();
        let sql = "WITH c1 AS (SELECT x FROM c2), c2 AS (SELECT x FROM c1) SELECT x FROM c1";
        let rows = trace_lineage(sql, sql, Dialect::Generic, &m, &map, &mut sink);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn transformation_never_references_a_cte_name() {
        let mut map = ReferenceMap::new();
        map.insert("db.sch.raw", vec!["price".into(), "qty".into()]);
        let m = model("db", "sch", "revenue", "");
        let sql = "WITH a AS (SELECT price, qty FROM db.sch.raw), b AS (SELECT price * qty AS revenue FROM a) SELECT revenue FROM b";
        let (rows, _sink) = run_pipeline(sql, &map, &m);
        assert_eq!(rows.len(), 1);
        let transformation = rows[0].transformation.to_lowercase();
        assert!(!transformation.contains(" a "));
        assert!(!transformation.contains("a."));
    }
}
