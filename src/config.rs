// Engine configuration.
//
// Every recognised option has a field here; loading from files or the
// environment is left to embedding applications.

use std::path::PathBuf;
use std::time::Duration;

use crate::transaction::types::IsolationLevel;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for adapter data files (catalog snapshot lives here too).
    pub data_dir: PathBuf,
    /// Directory for WAL segments.
    pub wal_dir: PathBuf,
    /// Sync every WAL append instead of group-syncing on commit + ticker.
    pub sync_writes: bool,
    /// Maximum size of a WAL segment before rotation.
    pub wal_segment_size: u64,
    /// Memory budget per sort/hash operator, in bytes.
    pub work_mem: usize,
    /// Upper bound on parallel workers per plan node.
    pub max_workers: usize,
    /// Per-statement deadline.
    pub statement_timeout: Duration,
    /// Whole-transaction deadline.
    pub transaction_timeout: Duration,
    /// Idle-in-transaction deadline before the session reaper aborts.
    pub idle_transaction_timeout: Duration,
    /// Lock acquisition deadline; expiry breaks deadlocks.
    pub lock_timeout: Duration,
    /// Isolation level for transactions that do not specify one.
    pub default_isolation: IsolationLevel,
    /// Number of plans retained by the LRU plan cache.
    pub plan_cache_size: usize,
    pub enable_hash_join: bool,
    pub enable_merge_join: bool,
    pub enable_index_scan: bool,
    pub enable_parallel_scan: bool,
    /// Batching hint only; row semantics are identical either way.
    pub enable_vectorization: bool,
    /// Rows per executor batch.
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_dir: PathBuf::from("./data/wal"),
            sync_writes: false,
            wal_segment_size: 64 * 1024 * 1024,
            work_mem: 64 * 1024 * 1024,
            max_workers: 8,
            statement_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(300),
            idle_transaction_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(10),
            default_isolation: IsolationLevel::ReadCommitted,
            plan_cache_size: 1000,
            enable_hash_join: true,
            enable_merge_join: true,
            enable_index_scan: true,
            enable_parallel_scan: true,
            enable_vectorization: false,
            batch_size: 1000,
        }
    }
}

impl Config {
    /// Configuration rooted at a single directory, WAL nested inside.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let data_dir = dir.into();
        let wal_dir = data_dir.join("wal");
        Self {
            data_dir,
            wal_dir,
            ..Default::default()
        }
    }

    pub fn worker_count(&self) -> usize {
        self.max_workers.min(num_cpus::get().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.plan_cache_size, 1000);
        assert_eq!(cfg.batch_size, 1000);
        assert!(!cfg.sync_writes);
        assert_eq!(cfg.default_isolation, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_config_at_nests_wal_dir() {
        let cfg = Config::at("/tmp/mantis");
        assert_eq!(cfg.wal_dir, PathBuf::from("/tmp/mantis/wal"));
    }
}
