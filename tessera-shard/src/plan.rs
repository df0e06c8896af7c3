//! INSERT planning: shard-key extraction and parse-tree rewrite
//!
//! A multi-row INSERT against a sharded table becomes one single-row INSERT
//! per input row, each targeting the shard table its timestamp resolves to.
//! Positional bind markers (`?`, `?N`, `$N`) are renamed to the named form
//! `:vN` (`N` being the marker's 1-based ordinal in the original statement)
//! so that each row's pruned argument subset still binds correctly; `$name`
//! markers are kept verbatim.

use std::sync::Mutex;

use rusqlite::types::Value as SqlValue;
use sqlparser::ast::{Expr, Ident, SetExpr, Statement, UnaryOperator, Value};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::args::{self, NamedParam};
use crate::conf::{shard_id_for, shard_table_name};
use crate::conn::ShardingConn;
use crate::errors::ShardError;

/// A planned statement ready for execution.
#[derive(Debug)]
pub enum Primitive {
    /// No sharding config for the target table; execute as-is.
    Passthrough {
        query: String,
        args: Vec<NamedParam>,
    },
    /// One rewritten single-row INSERT per input row.
    ShardedInsert(Insert),
}

/// The sharded-insert plan. The internal lock keeps a plan from being
/// re-entered while it executes.
#[derive(Debug)]
pub struct Insert {
    pub(crate) lock: Mutex<()>,
    pub(crate) rows: Vec<SingleRowPrimitive>,
}

impl Insert {
    /// The per-row primitives, in input order.
    pub fn rows(&self) -> &[SingleRowPrimitive] {
        &self.rows
    }
}

/// One single-row INSERT routed to its shard table, with the subset of
/// bind arguments its value tuple references.
#[derive(Debug, Clone)]
pub struct SingleRowPrimitive {
    pub(crate) query: String,
    pub(crate) args: Vec<(String, SqlValue)>,
}

impl SingleRowPrimitive {
    /// The rewritten SQL text.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The pruned named arguments for this row.
    pub fn args(&self) -> &[(String, SqlValue)] {
        &self.args
    }
}

impl ShardingConn {
    /// Parse and plan a query. Anything that is not a single INSERT against
    /// a sharded table becomes a passthrough.
    pub fn plan_query(
        &self,
        query: &str,
        query_args: &[NamedParam],
    ) -> Result<Primitive, ShardError> {
        let stmts = Parser::parse_sql(&SQLiteDialect {}, query)?;
        if let [stmt @ Statement::Insert { .. }] = stmts.as_slice() {
            return self.build_insert_plan(query, stmt, query_args);
        }
        Ok(Primitive::Passthrough {
            query: query.to_string(),
            args: query_args.to_vec(),
        })
    }

    /// Build the route for one INSERT statement.
    pub(crate) fn build_insert_plan(
        &self,
        query: &str,
        ins: &Statement,
        query_args: &[NamedParam],
    ) -> Result<Primitive, ShardError> {
        debug!(query, args = query_args.len(), "building insert plan");

        let (table_name, columns, or, on, replace_into) = match ins {
            Statement::Insert {
                table_name,
                columns,
                or,
                on,
                replace_into,
                ..
            } => (table_name, columns, or, on, *replace_into),
            _ => {
                return Ok(Primitive::Passthrough {
                    query: query.to_string(),
                    args: query_args.to_vec(),
                })
            }
        };

        let base_name = match table_name.0.last() {
            Some(ident) => ident.value.clone(),
            None => {
                return Ok(Primitive::Passthrough {
                    query: query.to_string(),
                    args: query_args.to_vec(),
                })
            }
        };

        let conf = match self.conf(&base_name) {
            Some(conf) => conf,
            None => {
                return Ok(Primitive::Passthrough {
                    query: query.to_string(),
                    args: query_args.to_vec(),
                })
            }
        };
        if !conf.is_usable() {
            return Err(ShardError::BadShardConfig { table: base_name });
        }

        if replace_into || or.is_some() || on.is_some() {
            return Err(ShardError::UnsupportedShardedUpsert {
                query: query.to_string(),
            });
        }

        let shard_col_index = columns
            .iter()
            .position(|c| c.value.eq_ignore_ascii_case(&conf.shard_col_name))
            .ok_or_else(|| ShardError::ShardColNotFound {
                query: query.to_string(),
            })?;

        let rows = values_rows(ins).ok_or_else(|| ShardError::UnsupportedInsertForm {
            query: query.to_string(),
        })?;
        let rows = normalize_markers(rows.clone());

        let mut instructions = Vec::with_capacity(rows.len());
        for row in &rows {
            let key_expr = row.get(shard_col_index).ok_or_else(|| {
                ShardError::ShardColNotFound {
                    query: query.to_string(),
                }
            })?;
            let insert_ts = resolve_shard_ts(query, key_expr, query_args)?;
            let shard_id = shard_id_for(&conf, insert_ts)?;
            debug!(insert_ts, shard_id, "resolved shard for row");

            self.ensure_shard_table(&base_name, shard_id)?;

            let row_args = prune_row_args(row, query_args)?;
            let shard = shard_table_name(&base_name, shard_id);
            let sql = render_single_row(ins, &shard, row.clone());
            debug!(sql = %sql, "rewritten single-row insert");
            instructions.push(SingleRowPrimitive {
                query: sql,
                args: row_args,
            });
        }

        Ok(Primitive::ShardedInsert(Insert {
            lock: Mutex::new(()),
            rows: instructions,
        }))
    }
}

/// The VALUES rows of an INSERT, if it carries a plain VALUES list.
fn values_rows(ins: &Statement) -> Option<&Vec<Vec<Expr>>> {
    let source = match ins {
        Statement::Insert { source, .. } => source,
        _ => return None,
    };
    match source.as_deref() {
        Some(query) => match query.body.as_ref() {
            SetExpr::Values(values) => Some(&values.rows),
            _ => None,
        },
        None => None,
    }
}

/// Rename every positional marker to `:vN`, resolving bare `?` to the next
/// unused 1-based index the way the row store does. Named `$name` markers
/// pass through untouched.
fn normalize_markers(mut rows: Vec<Vec<Expr>>) -> Vec<Vec<Expr>> {
    let mut max_ordinal = 0usize;
    for row in &mut rows {
        for expr in row.iter_mut() {
            if let Expr::Value(Value::Placeholder(marker)) = expr {
                if let Some(ordinal) = positional_ordinal(marker, max_ordinal) {
                    max_ordinal = max_ordinal.max(ordinal);
                    *marker = format!(":v{ordinal}");
                }
            }
        }
    }
    rows
}

/// The 1-based ordinal of a positional marker, or `None` for named markers.
fn positional_ordinal(marker: &str, max_so_far: usize) -> Option<usize> {
    match marker.as_bytes().first() {
        Some(b'?') => {
            let digits = &marker[1..];
            if digits.is_empty() {
                Some(max_so_far + 1)
            } else {
                digits.parse().ok()
            }
        }
        Some(b'$') => marker[1..].parse().ok(),
        _ => None,
    }
}

/// Resolve the shard-column expression of one row to an integer timestamp.
fn resolve_shard_ts(
    query: &str,
    expr: &Expr,
    query_args: &[NamedParam],
) -> Result<i64, ShardError> {
    match expr {
        Expr::Value(Value::Number(n, _)) => {
            n.parse().map_err(|_| ShardError::BadShardKeyType {
                query: query.to_string(),
            })
        }
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match inner.as_ref() {
            Expr::Value(Value::Number(n, _)) => n
                .parse::<i64>()
                .map(|v| -v)
                .map_err(|_| ShardError::BadShardKeyType {
                    query: query.to_string(),
                }),
            _ => Err(ShardError::NonLiteralShardKey {
                query: query.to_string(),
            }),
        },
        Expr::Value(Value::Placeholder(marker)) => {
            let arg = lookup_marker(marker, query_args)?;
            match arg.value {
                SqlValue::Integer(ts) => Ok(ts),
                _ => Err(ShardError::BadShardKeyType {
                    query: query.to_string(),
                }),
            }
        }
        Expr::Value(_) => Err(ShardError::BadShardKeyType {
            query: query.to_string(),
        }),
        _ => Err(ShardError::NonLiteralShardKey {
            query: query.to_string(),
        }),
    }
}

/// Find the argument a (normalized) marker refers to.
fn lookup_marker<'a>(
    marker: &str,
    query_args: &'a [NamedParam],
) -> Result<&'a NamedParam, ShardError> {
    let resolved = if let Some(ordinal) = marker.strip_prefix(":v").and_then(|d| d.parse().ok()) {
        args::resolve(query_args, None, Some(ordinal))
    } else {
        args::resolve(query_args, Some(marker), None)
    };
    resolved.ok_or_else(|| ShardError::BindNotFound {
        marker: marker.to_string(),
    })
}

/// Collect, in marker order, the arguments referenced by one row's value
/// tuple. Literal expressions contribute nothing.
fn prune_row_args(
    row: &[Expr],
    query_args: &[NamedParam],
) -> Result<Vec<(String, SqlValue)>, ShardError> {
    let mut row_args = Vec::new();
    for expr in row {
        if let Expr::Value(Value::Placeholder(marker)) = expr {
            let arg = lookup_marker(marker, query_args)?;
            row_args.push((marker.clone(), arg.value.clone()));
        }
    }
    Ok(row_args)
}

/// Synthesize the single-row INSERT targeting `shard`, preserving action,
/// ignore, partitions and columns, and replacing the rows with `row`.
fn render_single_row(ins: &Statement, shard: &str, row: Vec<Expr>) -> String {
    let mut single = ins.clone();
    if let Statement::Insert {
        table_name,
        on,
        returning,
        source,
        ..
    } = &mut single
    {
        if let Some(last) = table_name.0.last_mut() {
            *last = Ident::new(shard);
        }
        *on = None;
        *returning = None;
        if let Some(query) = source.as_deref_mut() {
            if let SetExpr::Values(values) = query.body.as_mut() {
                values.rows = vec![row];
            }
        }
    }
    single.to_string()
}
