//! Error types for the sharding router

use thiserror::Error;

/// Errors surfaced by planning, shard materialization and execution.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Sharding is configured for the table but the shard column is not
    /// present in the INSERT column list.
    #[error("sharding column not found in: {query}")]
    ShardColNotFound { query: String },

    /// The shard-column expression is not a literal or bind marker
    /// (e.g. `strftime('%s','now')`).
    #[error("non-literal shard key in: {query}")]
    NonLiteralShardKey { query: String },

    /// A bind marker in the row could not be resolved against the
    /// supplied arguments.
    #[error("bind argument not found for marker {marker}")]
    BindNotFound { marker: String },

    /// The resolved shard-key value is not an integer timestamp.
    #[error("shard key is not an integer timestamp in: {query}")]
    BadShardKeyType { query: String },

    /// REPLACE INTO / upsert forms are not supported on sharded tables.
    #[error("unsupported upsert on sharded table in: {query}")]
    UnsupportedShardedUpsert { query: String },

    /// The INSERT does not carry a plain VALUES list (e.g. INSERT ... SELECT).
    #[error("unsupported INSERT form on sharded table in: {query}")]
    UnsupportedInsertForm { query: String },

    /// The insert timestamp precedes the configured shard start time.
    #[error("insert time {ts} before shard start time {start}")]
    InsertBeforeShardStart { ts: i64, start: i64 },

    /// The base table's schema DDL could not be fetched from the store.
    #[error("fetching schema for table {table} failed")]
    SchemaFetchFailed { table: String },

    /// The base schema could not be rewritten for the shard table.
    #[error("rewriting schema of {table} for shard {shard} failed")]
    SchemaRewriteFailed { table: String, shard: String },

    /// Executing the shard table DDL failed.
    #[error("creating shard table {shard} failed: {source}")]
    ShardDdlFailed {
        shard: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Sharding is enabled for the table but the configuration is unusable.
    #[error("sharding conf set but not configured for table {table}")]
    BadShardConfig { table: String },

    /// A transaction rollback failed after an execution error; both are kept.
    #[error("rollback failed ({rollback}) while handling: {source}")]
    RollbackFailed {
        #[source]
        source: Box<ShardError>,
        rollback: rusqlite::Error,
    },

    /// SQL parse failure from the underlying parser.
    #[error(transparent)]
    Parse(#[from] sqlparser::parser::ParserError),

    /// Driver-level failure from the underlying row store.
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}
