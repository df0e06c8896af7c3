//! Time-sharded SQL INSERT router
//!
//! Rewrites `INSERT` statements against a logically-single table into
//! per-shard inserts keyed by a timestamp column:
//! - `conf` - per-table sharding configuration and shard naming
//! - `conn` - sharding connection, shard DDL materialization, execution
//! - `plan` - INSERT parse-tree surgery and bind-argument pruning
//! - `args` - named/positional bind arguments

pub mod args;
pub mod conf;
pub mod conn;
pub mod errors;
pub mod plan;

pub use args::NamedParam;
pub use conf::{shard_id_for, shard_table_name, ShardingConf, SHARD_SUFFIX};
pub use conn::{ExecResult, ShardingConn};
pub use errors::ShardError;
pub use plan::{Insert, Primitive, SingleRowPrimitive};
