//! Sharding connection: shard DDL materialization and plan execution

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params_from_iter, Connection, OptionalExtension, ToSql};
use tracing::debug;

use crate::conf::{shard_table_name, ShardingConf};
use crate::errors::ShardError;
use crate::plan::Primitive;

/// Aggregate result of executing a planned statement.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    /// Sum of per-row affected counts.
    pub rows_affected: u64,
    /// Last-insert id of the final row executed.
    pub last_insert_id: i64,
}

/// A connection to the row store carrying sharding configuration and the
/// set of shard tables known to exist.
pub struct ShardingConn {
    db: Mutex<Connection>,
    conf: HashMap<String, ShardingConf>,
    shard_tables: Mutex<HashSet<String>>,
}

impl ShardingConn {
    /// Open the row store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ShardError> {
        Ok(Self::wrap(Connection::open(path)?))
    }

    /// Open an in-memory row store (used by tests).
    pub fn open_in_memory() -> Result<Self, ShardError> {
        Ok(Self::wrap(Connection::open_in_memory()?))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            conf: HashMap::new(),
            shard_tables: Mutex::new(HashSet::new()),
        }
    }

    /// Register the sharding configuration for a base table.
    pub fn set_conf(&mut self, table: impl Into<String>, conf: ShardingConf) {
        self.conf.insert(table.into(), conf);
    }

    /// The sharding configuration of a base table, if any.
    pub fn conf(&self, table: &str) -> Option<ShardingConf> {
        self.conf.get(table).cloned()
    }

    /// Run raw DDL on the store.
    pub fn exec_ddl(&self, sql: &str) -> Result<(), ShardError> {
        self.lock_db().execute_batch(sql)?;
        Ok(())
    }

    fn lock_db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_known(&self) -> MutexGuard<'_, HashSet<String>> {
        self.shard_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Shard schema materialization
    // ========================================================================

    /// Idempotently create `<base>_ts_<shard_id>` mirroring the base schema.
    /// Concurrent callers may race to the DDL; the `IF NOT EXISTS` guard in
    /// the synthesized schema is the ultimate arbiter.
    pub fn ensure_shard_table(&self, base: &str, shard_id: i64) -> Result<(), ShardError> {
        let shard = shard_table_name(base, shard_id);
        if self.lock_known().contains(&shard) {
            return Ok(());
        }

        let origin = self.table_schema(base)?;
        let ddl = generate_shard_schema(&origin, base, &shard)?;
        debug!(shard = %shard, "materializing shard table");
        self.lock_db()
            .execute_batch(&ddl)
            .map_err(|source| ShardError::ShardDdlFailed {
                shard: shard.clone(),
                source,
            })?;
        self.lock_known().insert(shard);
        Ok(())
    }

    /// Fetch the stored schema DDL of a table.
    fn table_schema(&self, table: &str) -> Result<String, ShardError> {
        let schema: Option<String> = self
            .lock_db()
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        schema.ok_or_else(|| ShardError::SchemaFetchFailed {
            table: table.to_string(),
        })
    }

    /// Whether a shard table is present in the store.
    pub fn shard_table_exists(&self, name: &str) -> Result<bool, ShardError> {
        let count: i64 = self.lock_db().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute a planned statement. A sharded insert runs all rows inside a
    /// single transaction and rolls everything back on the first failure.
    pub fn exec(&self, primitive: &Primitive) -> Result<ExecResult, ShardError> {
        match primitive {
            Primitive::Passthrough { query, args } => {
                let conn = self.lock_db();
                let rows = if !args.is_empty() && args.iter().all(|a| a.name.is_some()) {
                    let named: Vec<(&str, &dyn ToSql)> = args
                        .iter()
                        .map(|a| (a.name.as_deref().unwrap_or_default(), &a.value as &dyn ToSql))
                        .collect();
                    conn.execute(query, named.as_slice())?
                } else {
                    let mut ordered: Vec<_> = args.iter().collect();
                    ordered.sort_by_key(|a| a.ordinal);
                    conn.execute(
                        query,
                        params_from_iter(ordered.into_iter().map(|a| a.value.clone())),
                    )?
                };
                Ok(ExecResult {
                    rows_affected: rows as u64,
                    last_insert_id: conn.last_insert_rowid(),
                })
            }
            Primitive::ShardedInsert(plan) => {
                let _plan_guard = plan.lock.lock().unwrap_or_else(PoisonError::into_inner);
                let mut conn = self.lock_db();
                let tx = conn.transaction()?;

                let mut result = ExecResult::default();
                let mut failure: Option<ShardError> = None;
                for row in &plan.rows {
                    let named: Vec<(&str, &dyn ToSql)> = row
                        .args
                        .iter()
                        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                        .collect();
                    match tx.execute(&row.query, named.as_slice()) {
                        Ok(affected) => {
                            result.rows_affected += affected as u64;
                            result.last_insert_id = tx.last_insert_rowid();
                        }
                        Err(err) => {
                            failure = Some(err.into());
                            break;
                        }
                    }
                }

                match failure {
                    Some(err) => match tx.rollback() {
                        Ok(()) => Err(err),
                        Err(rollback) => Err(ShardError::RollbackFailed {
                            source: Box::new(err),
                            rollback,
                        }),
                    },
                    None => {
                        tx.commit()?;
                        Ok(result)
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, table: &str) -> i64 {
        self.lock_db()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }
}

/// Rewrite the base table's DDL for a shard table, guarding with
/// `IF NOT EXISTS` so concurrent materialization stays idempotent.
fn generate_shard_schema(origin: &str, base: &str, shard: &str) -> Result<String, ShardError> {
    if !origin.contains(base) {
        return Err(ShardError::SchemaRewriteFailed {
            table: base.to_string(),
            shard: shard.to_string(),
        });
    }
    let mut rewritten = origin.replacen(base, shard, 1);
    let upper = rewritten.to_ascii_uppercase();
    if let Some(pos) = upper.find("CREATE TABLE") {
        if !upper.contains("IF NOT EXISTS") {
            rewritten.insert_str(pos + "CREATE TABLE".len(), " IF NOT EXISTS");
        }
    }
    Ok(rewritten)
}
