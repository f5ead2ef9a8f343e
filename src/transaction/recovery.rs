// Crash recovery.
//
// Analysis scans the segments in LSN order and classifies every
// transaction; replay re-applies the operations of committed transactions
// to the storage adapters, in LSN order, relying on idempotent re-delivery.
// No undo pass exists because storage mutations are withheld until COMMIT
// is logged. An integrity failure bounds the whole procedure at the last
// good LSN.

use std::path::PathBuf;
use std::time::Duration;

use crate::common::{Lsn, TransactionId};
use crate::error::{DbError, Result};
use crate::monitoring::metrics::{metrics, names};
use crate::storage::{write_with_retry, AdapterRegistry, StorageType, WriteOp};

use super::wal::{IntegrityIssue, WalEntry, WalManager, WalOperation};

const REPLAY_RETRY_ATTEMPTS: u32 = 3;
const REPLAY_RETRY_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnalyzedState {
    Active,
    Committed,
    Aborted,
}

/// One mutation scheduled for replay.
#[derive(Debug, Clone)]
pub struct ReplayOp {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub write: WriteOp,
}

/// Everything analysis learned from the log.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// Operations of committed transactions, in LSN order.
    pub replay: Vec<ReplayOp>,
    pub committed: Vec<TransactionId>,
    pub aborted: Vec<TransactionId>,
    /// Still active at end of log; their writes are dropped.
    pub incomplete: Vec<TransactionId>,
    /// In-doubt distributed transactions: prepared, no durable decision.
    pub in_doubt: Vec<(TransactionId, Vec<String>)>,
    pub last_good_lsn: Lsn,
    pub max_txn_id: TransactionId,
    pub issues: Vec<IntegrityIssue>,
}

#[derive(Debug)]
pub struct IntegrityReport {
    pub records_scanned: u64,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct RecoveryManager {
    wal_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
        }
    }

    /// Phase 1: scan and classify. Entries past a checksum failure never
    /// reach us; `read_segments` already truncated there.
    pub fn analyze(&self) -> Result<RecoveryPlan> {
        metrics().incr(names::RECOVERY_ATTEMPTS);
        let (entries, issues) = WalManager::read_segments(&self.wal_dir)?;
        Ok(Self::analyze_entries(entries, issues))
    }

    fn analyze_entries(entries: Vec<WalEntry>, issues: Vec<IntegrityIssue>) -> RecoveryPlan {
        use std::collections::HashMap;

        struct TxnRecord {
            state: AnalyzedState,
            ops: Vec<ReplayOp>,
            prepared: Option<Vec<String>>,
        }

        let mut table: HashMap<TransactionId, TxnRecord> = HashMap::new();
        let mut order: Vec<TransactionId> = Vec::new();
        let mut plan = RecoveryPlan {
            issues,
            ..Default::default()
        };

        for entry in &entries {
            plan.last_good_lsn = entry.lsn;
            plan.max_txn_id = plan.max_txn_id.max(entry.txn_id);
            let record = table.entry(entry.txn_id).or_insert_with(|| {
                order.push(entry.txn_id);
                TxnRecord {
                    state: AnalyzedState::Active,
                    ops: Vec::new(),
                    prepared: None,
                }
            });
            match &entry.op {
                WalOperation::Begin => {}
                WalOperation::Insert { .. }
                | WalOperation::Update { .. }
                | WalOperation::Delete { .. } => {
                    if let Some(write) = entry.op.to_write_op(entry.lsn) {
                        record.ops.push(ReplayOp {
                            lsn: entry.lsn,
                            txn_id: entry.txn_id,
                            write,
                        });
                    }
                }
                WalOperation::Commit => record.state = AnalyzedState::Committed,
                WalOperation::Abort => record.state = AnalyzedState::Aborted,
                WalOperation::TwoPhasePrepare { participants } => {
                    record.prepared = Some(participants.clone());
                }
                WalOperation::Checkpoint { .. } | WalOperation::SavepointMark { .. } => {}
            }
        }

        for txn_id in order {
            let record = &table[&txn_id];
            match record.state {
                AnalyzedState::Committed => plan.committed.push(txn_id),
                AnalyzedState::Aborted => plan.aborted.push(txn_id),
                AnalyzedState::Active => {
                    if txn_id != 0 {
                        plan.incomplete.push(txn_id);
                    }
                    if let Some(participants) = &record.prepared {
                        plan.in_doubt.push((txn_id, participants.clone()));
                    }
                }
            }
        }

        // Replay list: committed transactions' operations only, LSN order.
        let mut replay: Vec<ReplayOp> = table
            .iter()
            .filter(|(_, r)| r.state == AnalyzedState::Committed)
            .flat_map(|(_, r)| r.ops.iter().cloned())
            .collect();
        replay.sort_by_key(|op| op.lsn);
        plan.replay = replay;
        plan
    }

    /// Phase 2: re-apply committed mutations through the adapters. A
    /// persistent storage failure fails the whole recovery; re-running it
    /// is safe because adapters accept re-delivered writes.
    pub fn replay(
        &self,
        plan: &RecoveryPlan,
        adapters: &AdapterRegistry,
        storage_of: impl Fn(&str) -> StorageType,
    ) -> Result<()> {
        let mut batch: Vec<WriteOp> = Vec::new();
        let mut batch_storage: Option<StorageType> = None;

        let flush = |storage: Option<StorageType>, batch: &mut Vec<WriteOp>| -> Result<()> {
            if let Some(storage) = storage {
                if !batch.is_empty() {
                    let adapter = adapters.adapter(storage);
                    write_with_retry(
                        adapter.as_ref(),
                        batch,
                        REPLAY_RETRY_ATTEMPTS,
                        REPLAY_RETRY_BACKOFF,
                    )?;
                    batch.clear();
                }
            }
            Ok(())
        };

        for op in &plan.replay {
            let storage = storage_of(&op.write.table);
            if batch_storage != Some(storage) {
                flush(batch_storage, &mut batch)?;
                batch_storage = Some(storage);
            }
            batch.push(op.write.clone());
        }
        flush(batch_storage, &mut batch).inspect_err(|_| {
            metrics().incr(names::RECOVERY_FAILURES);
        })?;

        tracing::info!(
            replayed = plan.replay.len(),
            committed = plan.committed.len(),
            incomplete = plan.incomplete.len(),
            last_good_lsn = plan.last_good_lsn,
            "recovery replay complete"
        );
        Ok(())
    }

    /// Full pass over the log, reporting every integrity issue without
    /// mutating anything.
    pub fn validate_integrity(&self) -> Result<IntegrityReport> {
        let (entries, issues) = WalManager::read_segments(&self.wal_dir)?;
        Ok(IntegrityReport {
            records_scanned: entries.len() as u64,
            issues,
        })
    }

    /// Convenience for engine startup: analyze then replay.
    pub fn recover(
        &self,
        adapters: &AdapterRegistry,
        storage_of: impl Fn(&str) -> StorageType,
    ) -> Result<RecoveryPlan> {
        let plan = self.analyze()?;
        self.replay(&plan, adapters, storage_of)
            .map_err(|e| match e {
                DbError::DurabilityFailure(msg) => DbError::DurabilityFailure(format!(
                    "recovery replay failed; restart required: {}",
                    msg
                )),
                other => other,
            })?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::common::Value;
    use crate::transaction::wal::{SyncMode, WalConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn wal(dir: &std::path::Path) -> WalManager {
        WalManager::open(WalConfig {
            dir: dir.to_path_buf(),
            segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::GroupSync,
            sync_interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    fn insert(table: &str, key: &str, v: i64) -> WalOperation {
        WalOperation::Insert {
            table: table.to_string(),
            key: key.to_string(),
            value: vec![Value::Integer(v)],
        }
    }

    fn registry() -> AdapterRegistry {
        AdapterRegistry::new(Arc::new(Catalog::new()))
    }

    #[test]
    fn test_committed_transaction_replays() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(1, insert("t", "1", 10)).unwrap();
        wal.append(1, insert("t", "2", 20)).unwrap();
        wal.append(1, WalOperation::Commit).unwrap();
        wal.sync().unwrap();

        let rm = RecoveryManager::new(dir.path());
        let plan = rm.analyze().unwrap();
        assert_eq!(plan.committed, vec![1]);
        assert_eq!(plan.replay.len(), 2);

        let adapters = registry();
        rm.replay(&plan, &adapters, |_| StorageType::Kv).unwrap();
        let rows = adapters
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_incomplete_transaction_dropped() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(1, insert("t", "1", 10)).unwrap();
        // No COMMIT: simulated crash.
        wal.sync().unwrap();

        let rm = RecoveryManager::new(dir.path());
        let plan = rm.analyze().unwrap();
        assert_eq!(plan.incomplete, vec![1]);
        assert!(plan.replay.is_empty());

        let adapters = registry();
        rm.replay(&plan, &adapters, |_| StorageType::Kv).unwrap();
        assert!(adapters
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_aborted_transaction_dropped() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(1, insert("t", "1", 10)).unwrap();
        wal.append(1, WalOperation::Abort).unwrap();
        wal.sync().unwrap();

        let plan = RecoveryManager::new(dir.path()).analyze().unwrap();
        assert_eq!(plan.aborted, vec![1]);
        assert!(plan.replay.is_empty());
    }

    #[test]
    fn test_interleaved_transactions_replay_in_lsn_order() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(2, WalOperation::Begin).unwrap();
        wal.append(1, insert("t", "1", 1)).unwrap();
        wal.append(2, insert("t", "2", 2)).unwrap();
        wal.append(1, insert("t", "3", 3)).unwrap();
        wal.append(2, WalOperation::Commit).unwrap();
        wal.append(1, WalOperation::Commit).unwrap();
        wal.sync().unwrap();

        let plan = RecoveryManager::new(dir.path()).analyze().unwrap();
        assert_eq!(plan.replay.len(), 3);
        let lsns: Vec<Lsn> = plan.replay.iter().map(|op| op.lsn).collect();
        let mut sorted = lsns.clone();
        sorted.sort();
        assert_eq!(lsns, sorted);
    }

    #[test]
    fn test_compensated_savepoint_nets_out() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(1, insert("t", "1", 1)).unwrap();
        wal.append(
            1,
            WalOperation::SavepointMark {
                name: "s".to_string(),
            },
        )
        .unwrap();
        wal.append(1, insert("t", "2", 2)).unwrap();
        // Compensating delete for the rolled-back insert.
        wal.append(
            1,
            WalOperation::Delete {
                table: "t".to_string(),
                key: "2".to_string(),
                old: vec![Value::Integer(2)],
            },
        )
        .unwrap();
        wal.append(1, WalOperation::Commit).unwrap();
        wal.sync().unwrap();

        let rm = RecoveryManager::new(dir.path());
        let plan = rm.analyze().unwrap();
        let adapters = registry();
        rm.replay(&plan, &adapters, |_| StorageType::Kv).unwrap();

        let rows = adapters
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "1");
    }

    #[test]
    fn test_in_doubt_prepared_transaction_reported() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(9, WalOperation::Begin).unwrap();
        wal.append(
            9,
            WalOperation::TwoPhasePrepare {
                participants: vec!["kv".to_string(), "columnar".to_string()],
            },
        )
        .unwrap();
        wal.sync().unwrap();

        let plan = RecoveryManager::new(dir.path()).analyze().unwrap();
        assert_eq!(plan.in_doubt.len(), 1);
        assert_eq!(plan.in_doubt[0].0, 9);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(1, insert("t", "1", 10)).unwrap();
        wal.append(1, WalOperation::Commit).unwrap();
        wal.sync().unwrap();

        let rm = RecoveryManager::new(dir.path());
        let plan = rm.analyze().unwrap();
        let adapters = registry();
        rm.replay(&plan, &adapters, |_| StorageType::Kv).unwrap();
        rm.replay(&plan, &adapters, |_| StorageType::Kv).unwrap();
        assert_eq!(
            adapters
                .adapter(StorageType::Kv)
                .scan("t", &[])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_validate_integrity_clean_log() {
        let dir = tempdir().unwrap();
        let wal = wal(dir.path());
        wal.append(1, WalOperation::Begin).unwrap();
        wal.append(1, WalOperation::Commit).unwrap();
        wal.shutdown().unwrap();

        let report = RecoveryManager::new(dir.path())
            .validate_integrity()
            .unwrap();
        assert!(report.is_ok());
        assert_eq!(report.records_scanned, 2);
    }
}
