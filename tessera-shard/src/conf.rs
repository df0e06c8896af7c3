//! Per-table sharding configuration and shard naming

use serde::{Deserialize, Serialize};

use crate::errors::ShardError;

/// Shard table suffix separator. Part of the on-disk contract: producers
/// and readers must agree on `<base>_ts_<shardId>`.
pub const SHARD_SUFFIX: &str = "_ts_";

/// Sharding configuration for one base table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConf {
    /// Name of the timestamp column the shard id is derived from.
    pub shard_col_name: String,
    /// Width of one shard window in seconds.
    pub shard_interval: i64,
    /// Unix-seconds timestamp of the first shard window.
    pub shard_start_time: i64,
}

impl ShardingConf {
    /// A configuration is usable when the column is named and the
    /// interval is positive.
    pub fn is_usable(&self) -> bool {
        !self.shard_col_name.is_empty() && self.shard_interval > 0
    }
}

/// Compute the shard id for an insert timestamp, failing when the
/// timestamp precedes the shard start time.
pub fn shard_id_for(conf: &ShardingConf, insert_ts: i64) -> Result<i64, ShardError> {
    let diff = insert_ts - conf.shard_start_time;
    if diff < 0 {
        return Err(ShardError::InsertBeforeShardStart {
            ts: insert_ts,
            start: conf.shard_start_time,
        });
    }
    Ok(diff / conf.shard_interval)
}

/// Physical shard table name for a base table and shard id.
pub fn shard_table_name(base: &str, shard_id: i64) -> String {
    format!("{base}{SHARD_SUFFIX}{shard_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_id_windows() {
        let conf = ShardingConf {
            shard_col_name: "ts".to_string(),
            shard_interval: 3600,
            shard_start_time: 0,
        };
        assert_eq!(shard_id_for(&conf, 0).unwrap(), 0);
        assert_eq!(shard_id_for(&conf, 3599).unwrap(), 0);
        assert_eq!(shard_id_for(&conf, 3600).unwrap(), 1);
        assert_eq!(shard_id_for(&conf, 4000).unwrap(), 1);
    }

    #[test]
    fn shard_id_before_start() {
        let conf = ShardingConf {
            shard_col_name: "ts".to_string(),
            shard_interval: 3600,
            shard_start_time: 7200,
        };
        assert!(matches!(
            shard_id_for(&conf, 100),
            Err(ShardError::InsertBeforeShardStart { .. })
        ));
    }

    #[test]
    fn shard_name_format() {
        assert_eq!(shard_table_name("foo", 0), "foo_ts_0");
        assert_eq!(shard_table_name("foo", 42), "foo_ts_42");
    }
}
