// Transaction manager.
//
// Owns per-transaction state and the operation log, enforces the isolation
// to lock-discipline mapping, and drives the commit protocol:
//
//   1. validate the transaction is Active
//   2. append COMMIT and flush the WAL to the durability floor
//   3. apply the operation log to the storage adapters
//   4. release all locks
//   5. mark Committed
//
// Mutations are withheld from adapters until after step 2, which is what
// lets recovery run without an undo log.
//
// Serializable range locks: a scan's predicate is canonicalised to
// per-column intervals; readers take a shared lock on the canonical key and
// register the intervals, and every writer that produces a matching row
// must take the same key exclusively, so it blocks until the reader
// commits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::catalog::Catalog;
use crate::common::{Lsn, TransactionId, Value};
use crate::monitoring::metrics::{metrics, names};
use crate::storage::{
    write_with_retry, AdapterRegistry, ScanQual, StorageType, WriteKind, WriteOp,
};

use super::error::{TransactionError, TransactionResult};
use super::lock_manager::LockManager;
use super::types::{
    IsolationLevel, LockMode, SavepointSnapshot, Transaction, TransactionState, TxnOperation,
};
use super::wal::{WalManager, WalOperation};

const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(20);

// ============================================================================
// Predicate canonicalisation
// ============================================================================

/// Closed/open interval over one column.
#[derive(Debug, Clone)]
pub struct ColumnInterval {
    pub column: String,
    pub low: Option<(Value, bool)>,
    pub high: Option<(Value, bool)>,
}

impl ColumnInterval {
    fn contains(&self, value: &Value) -> bool {
        if let Some((low, inclusive)) = &self.low {
            match value.compare(low) {
                Some(std::cmp::Ordering::Greater) => {}
                Some(std::cmp::Ordering::Equal) if *inclusive => {}
                _ => return false,
            }
        }
        if let Some((high, inclusive)) = &self.high {
            match value.compare(high) {
                Some(std::cmp::Ordering::Less) => {}
                Some(std::cmp::Ordering::Equal) if *inclusive => {}
                _ => return false,
            }
        }
        true
    }

    fn render(&self) -> String {
        let low = match &self.low {
            Some((v, true)) => format!("[{}", v),
            Some((v, false)) => format!("({}", v),
            None => "(-inf".to_string(),
        };
        let high = match &self.high {
            Some((v, true)) => format!("{}]", v),
            Some((v, false)) => format!("{})", v),
            None => "+inf)".to_string(),
        };
        format!("{}:{},{}", self.column, low, high)
    }
}

/// Canonical lock key for a scan predicate: per-column intervals with
/// column names sorted, rendered deterministically. Predicates the
/// intervals cannot express collapse to the whole-table form.
pub fn canonical_predicate(table: &str, quals: &[ScanQual]) -> (String, Vec<ColumnInterval>) {
    use crate::storage::QualOp;

    if quals.is_empty() {
        return (format!("pred:{}:*", table), Vec::new());
    }

    let mut intervals: Vec<ColumnInterval> = Vec::new();
    for qual in quals {
        let interval = match intervals
            .iter_mut()
            .find(|i| i.column.eq_ignore_ascii_case(&qual.column))
        {
            Some(existing) => existing,
            None => {
                intervals.push(ColumnInterval {
                    column: qual.column.to_lowercase(),
                    low: None,
                    high: None,
                });
                intervals.last_mut().unwrap()
            }
        };
        match qual.op {
            QualOp::Eq => {
                interval.low = Some((qual.value.clone(), true));
                interval.high = Some((qual.value.clone(), true));
            }
            QualOp::Lt => interval.high = Some((qual.value.clone(), false)),
            QualOp::LtEq => interval.high = Some((qual.value.clone(), true)),
            QualOp::Gt => interval.low = Some((qual.value.clone(), false)),
            QualOp::GtEq => interval.low = Some((qual.value.clone(), true)),
        }
    }
    intervals.sort_by(|a, b| a.column.cmp(&b.column));

    let rendered: Vec<String> = intervals.iter().map(|i| i.render()).collect();
    (
        format!("pred:{}:{}", table, rendered.join("&")),
        intervals,
    )
}

#[derive(Debug, Clone)]
struct PredicateEntry {
    key: String,
    intervals: Vec<ColumnInterval>,
    txn_id: TransactionId,
}

/// Registered serializable-range predicates, per table.
#[derive(Default)]
struct PredicateRegistry {
    by_table: DashMap<String, Vec<PredicateEntry>>,
}

impl PredicateRegistry {
    fn register(&self, table: &str, entry: PredicateEntry) {
        self.by_table
            .entry(table.to_lowercase())
            .or_default()
            .push(entry);
    }

    /// Lock keys of predicates a row with these values falls under. A row
    /// value we cannot resolve matches conservatively.
    fn matching_keys(
        &self,
        table: &str,
        catalog: &Catalog,
        txn_id: TransactionId,
        values: Option<&[Value]>,
    ) -> Vec<String> {
        let Some(entries) = self.by_table.get(&table.to_lowercase()) else {
            return Vec::new();
        };
        let schema = catalog.get_table(table);
        entries
            .iter()
            .filter(|e| e.txn_id != txn_id)
            .filter(|e| {
                if e.intervals.is_empty() {
                    return true; // whole-table predicate
                }
                let (Some(values), Some(schema)) = (values, schema.as_ref()) else {
                    return true;
                };
                e.intervals.iter().all(|interval| {
                    match schema
                        .column_index(&interval.column)
                        .and_then(|idx| values.get(idx))
                    {
                        Some(value) => interval.contains(value),
                        None => true,
                    }
                })
            })
            .map(|e| e.key.clone())
            .collect()
    }

    fn remove_txn(&self, txn_id: TransactionId) {
        for mut entry in self.by_table.iter_mut() {
            entry.retain(|e| e.txn_id != txn_id);
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct TransactionManager {
    next_txn_id: AtomicU64,
    active: DashMap<TransactionId, Transaction>,
    lock_manager: Arc<LockManager>,
    wal: Arc<WalManager>,
    adapters: Arc<AdapterRegistry>,
    catalog: Arc<Catalog>,
    predicates: PredicateRegistry,
    lock_timeout: Duration,
    transaction_timeout: Duration,
    pub default_isolation: IsolationLevel,
}

pub fn row_resource(table: &str, key: &str) -> String {
    format!("row:{}:{}", table.to_lowercase(), key)
}

impl TransactionManager {
    pub fn new(
        wal: Arc<WalManager>,
        lock_manager: Arc<LockManager>,
        adapters: Arc<AdapterRegistry>,
        catalog: Arc<Catalog>,
        lock_timeout: Duration,
        transaction_timeout: Duration,
        default_isolation: IsolationLevel,
    ) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            active: DashMap::new(),
            lock_manager,
            wal,
            adapters,
            catalog,
            predicates: PredicateRegistry::default(),
            lock_timeout,
            transaction_timeout,
            default_isolation,
        }
    }

    /// Continue the id sequence above anything recovery saw in the log.
    pub fn seed_txn_ids(&self, max_seen: TransactionId) {
        let next = max_seen + 1;
        self.next_txn_id.fetch_max(next, Ordering::SeqCst);
    }

    pub fn begin(
        &self,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> TransactionResult<TransactionId> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.wal
            .append(txn_id, WalOperation::Begin)
            .map_err(|e| TransactionError::Wal(e.to_string()))?;

        let txn = Transaction::new(
            txn_id,
            isolation.unwrap_or(self.default_isolation),
            read_only,
        )
        .with_deadline(self.transaction_timeout);
        self.active.insert(txn_id, txn);
        metrics().incr(names::TXN_STARTED);
        Ok(txn_id)
    }

    pub fn is_active(&self, txn_id: TransactionId) -> bool {
        self.active.contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_transaction_ids(&self) -> Vec<TransactionId> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub fn isolation(&self, txn_id: TransactionId) -> Option<IsolationLevel> {
        self.active.get(&txn_id).map(|t| t.isolation)
    }

    pub fn is_read_only(&self, txn_id: TransactionId) -> bool {
        self.active
            .get(&txn_id)
            .map(|t| t.read_only)
            .unwrap_or(false)
    }

    fn check_live(&self, txn_id: TransactionId, operation: &'static str) -> TransactionResult<()> {
        let Some(mut txn) = self.active.get_mut(&txn_id) else {
            return Err(TransactionError::NotFound(txn_id));
        };
        if txn.state != TransactionState::Active {
            return Err(TransactionError::invalid_state(
                txn_id, txn.state, operation,
            ));
        }
        if txn.is_expired() {
            drop(txn);
            let _ = self.abort(txn_id);
            return Err(TransactionError::Expired { txn_id });
        }
        txn.touch();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Log one mutation into the transaction: exclusive row lock, predicate
    /// conflict locks, WAL append, operation-log entry. Returns the LSN.
    pub fn add_operation(
        &self,
        txn_id: TransactionId,
        mut op: WriteOp,
    ) -> TransactionResult<Lsn> {
        self.check_live(txn_id, "write")?;
        if self.is_read_only(txn_id) {
            let _ = self.abort(txn_id);
            return Err(TransactionError::ReadOnly(txn_id));
        }

        let resource = row_resource(&op.table, &op.key);
        if let Err(e) =
            self.lock_manager
                .acquire_with_timeout(txn_id, &resource, LockMode::Exclusive, self.lock_timeout)
        {
            let _ = self.abort(txn_id);
            return Err(e);
        }
        self.note_lock(txn_id, &resource);

        // Serializable readers with a matching range predicate must be
        // waited out before the write proceeds.
        let probe = op.values.as_deref().or(op.old.as_deref());
        let keys = self
            .predicates
            .matching_keys(&op.table, &self.catalog, txn_id, probe);
        for key in keys {
            if let Err(e) = self.lock_manager.acquire_with_timeout(
                txn_id,
                &key,
                LockMode::Exclusive,
                self.lock_timeout,
            ) {
                let _ = self.abort(txn_id);
                return Err(e);
            }
            self.note_lock(txn_id, &key);
        }

        let lsn = self
            .wal
            .append(txn_id, WalOperation::from_write_op(&op))
            .map_err(|e| {
                let _ = self.abort(txn_id);
                TransactionError::Wal(e.to_string())
            })?;
        op.version = lsn;

        let mut txn = self
            .active
            .get_mut(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        txn.operations.push(TxnOperation { write: op, lsn });
        Ok(lsn)
    }

    /// Exclusive row lock ahead of a write, so the caller can re-read and
    /// re-evaluate under the lock; `add_operation`'s own acquisition then
    /// is a no-op re-request.
    pub fn lock_for_write(
        &self,
        txn_id: TransactionId,
        table: &str,
        key: &str,
    ) -> TransactionResult<()> {
        self.check_live(txn_id, "write")?;
        let resource = row_resource(table, key);
        if let Err(e) = self.lock_manager.acquire_with_timeout(
            txn_id,
            &resource,
            LockMode::Exclusive,
            self.lock_timeout,
        ) {
            let _ = self.abort(txn_id);
            return Err(e);
        }
        self.note_lock(txn_id, &resource);
        Ok(())
    }

    fn note_lock(&self, txn_id: TransactionId, resource: &str) {
        if let Some(mut txn) = self.active.get_mut(&txn_id) {
            txn.record_lock(resource);
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Shared row lock per the isolation discipline. ReadCommitted releases
    /// at statement end; RepeatableRead and Serializable hold to commit.
    pub fn lock_for_read(
        &self,
        txn_id: TransactionId,
        table: &str,
        key: &str,
    ) -> TransactionResult<()> {
        let Some(isolation) = self.isolation(txn_id) else {
            return Err(TransactionError::NotFound(txn_id));
        };
        if !isolation.locks_reads() {
            return Ok(());
        }
        let resource = row_resource(table, key);
        self.lock_manager.acquire_with_timeout(
            txn_id,
            &resource,
            LockMode::Shared,
            self.lock_timeout,
        )?;
        let mut txn = self
            .active
            .get_mut(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        if isolation.holds_read_locks() {
            txn.record_lock(&resource);
        } else if !txn.statement_locks.iter().any(|r| r == &resource) {
            txn.statement_locks.push(resource);
        }
        Ok(())
    }

    /// Serializable range lock for a scan predicate: shared lock on the
    /// canonical key plus interval registration for writer conflicts.
    pub fn lock_for_scan(
        &self,
        txn_id: TransactionId,
        table: &str,
        quals: &[ScanQual],
    ) -> TransactionResult<()> {
        let Some(isolation) = self.isolation(txn_id) else {
            return Err(TransactionError::NotFound(txn_id));
        };
        if !isolation.locks_predicates() {
            return Ok(());
        }
        let (key, intervals) = canonical_predicate(table, quals);
        self.lock_manager
            .acquire_with_timeout(txn_id, &key, LockMode::Shared, self.lock_timeout)?;
        self.note_lock(txn_id, &key);
        self.predicates.register(
            table,
            PredicateEntry {
                key,
                intervals,
                txn_id,
            },
        );
        Ok(())
    }

    /// Release statement-scoped shared locks (ReadCommitted discipline).
    pub fn end_statement(&self, txn_id: TransactionId) {
        let Some(mut txn) = self.active.get_mut(&txn_id) else {
            return;
        };
        let resources = std::mem::take(&mut txn.statement_locks);
        drop(txn);
        for resource in resources {
            self.lock_manager.release(txn_id, &resource);
        }
    }

    /// Pending (uncommitted) mutations of a transaction against one table,
    /// for read-your-writes overlays.
    pub fn pending_ops(&self, txn_id: TransactionId, table: &str) -> Vec<WriteOp> {
        self.active
            .get(&txn_id)
            .map(|txn| {
                txn.operations
                    .iter()
                    .filter(|op| op.write.table.eq_ignore_ascii_case(table))
                    .map(|op| op.write.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Storage engines the transaction has touched, in first-touch order.
    pub fn touched_storage(&self, txn_id: TransactionId) -> Vec<StorageType> {
        let mut seen = Vec::new();
        if let Some(txn) = self.active.get(&txn_id) {
            for op in &txn.operations {
                let storage = self.storage_of(&op.write.table);
                if !seen.contains(&storage) {
                    seen.push(storage);
                }
            }
        }
        seen
    }

    pub fn storage_of(&self, table: &str) -> StorageType {
        self.catalog.storage_type(table).unwrap_or(StorageType::Kv)
    }

    // ------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------

    pub fn create_savepoint(&self, txn_id: TransactionId, name: &str) -> TransactionResult<()> {
        self.check_live(txn_id, "savepoint")?;
        let mut txn = self
            .active
            .get_mut(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        if txn.savepoint(name).is_some() {
            return Err(TransactionError::SavepointExists {
                txn_id,
                name: name.to_string(),
            });
        }
        let lsn = self
            .wal
            .append(
                txn_id,
                WalOperation::SavepointMark {
                    name: name.to_string(),
                },
            )
            .map_err(|e| TransactionError::Wal(e.to_string()))?;
        let snapshot = SavepointSnapshot {
            name: name.to_string(),
            op_len: txn.operations.len(),
            lock_mark: txn.held_locks.len(),
            lsn,
        };
        txn.savepoints.push(snapshot);
        Ok(())
    }

    /// Discard the snapshot (and any later ones) without undoing work.
    pub fn release_savepoint(&self, txn_id: TransactionId, name: &str) -> TransactionResult<()> {
        self.check_live(txn_id, "release savepoint")?;
        let mut txn = self
            .active
            .get_mut(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        let Some(pos) = txn.savepoints.iter().position(|sp| sp.name == name) else {
            return Err(TransactionError::SavepointNotFound {
                txn_id,
                name: name.to_string(),
            });
        };
        txn.savepoints.truncate(pos);
        Ok(())
    }

    /// Truncate the operation log back to the snapshot, logging a
    /// compensating entry for every undone write, and release write locks
    /// acquired since that the retained operations no longer need.
    pub fn rollback_to_savepoint(
        &self,
        txn_id: TransactionId,
        name: &str,
    ) -> TransactionResult<()> {
        self.check_live(txn_id, "rollback to savepoint")?;
        let mut txn = self
            .active
            .get_mut(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        let Some(pos) = txn.savepoints.iter().position(|sp| sp.name == name) else {
            return Err(TransactionError::SavepointNotFound {
                txn_id,
                name: name.to_string(),
            });
        };
        let snapshot = txn.savepoints[pos].clone();
        txn.savepoints.truncate(pos + 1);

        let undone: Vec<TxnOperation> = txn.operations.split_off(snapshot.op_len);
        let retained: HashSet<String> = txn
            .operations
            .iter()
            .map(|op| row_resource(&op.write.table, &op.write.key))
            .collect();
        let released: Vec<String> = txn
            .held_locks
            .split_off(snapshot.lock_mark)
            .into_iter()
            .filter(|resource| {
                if retained.contains(resource) || !resource.starts_with("row:") {
                    txn.held_locks.push(resource.clone());
                    false
                } else {
                    true
                }
            })
            .collect();
        drop(txn);

        // Compensations go out newest-first so recovery nets to the
        // snapshot state.
        for op in undone.iter().rev() {
            let compensation = match op.write.kind {
                WriteKind::Insert => WriteOp::delete(
                    op.write.table.clone(),
                    op.write.key.clone(),
                    op.write.values.clone().unwrap_or_default(),
                ),
                WriteKind::Update => WriteOp::update(
                    op.write.table.clone(),
                    op.write.key.clone(),
                    op.write.old.clone().unwrap_or_default(),
                    op.write.values.clone().unwrap_or_default(),
                ),
                WriteKind::Delete => WriteOp::insert(
                    op.write.table.clone(),
                    op.write.key.clone(),
                    op.write.old.clone().unwrap_or_default(),
                ),
            };
            self.wal
                .append(txn_id, WalOperation::from_write_op(&compensation))
                .map_err(|e| TransactionError::Wal(e.to_string()))?;
        }

        for resource in released {
            self.lock_manager.release(txn_id, &resource);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit / abort
    // ------------------------------------------------------------------

    /// Single-engine commit protocol.
    pub fn commit(&self, txn_id: TransactionId) -> TransactionResult<()> {
        self.check_live(txn_id, "commit")?;
        if let Some(mut txn) = self.active.get_mut(&txn_id) {
            txn.state = TransactionState::Preparing;
        }

        // Durability floor: COMMIT is not reported upstream until synced.
        self.wal
            .append(txn_id, WalOperation::Commit)
            .and_then(|_| self.wal.sync())
            .map_err(|e| {
                // Nothing durable promised yet; abort and release.
                let _ = self.abort_after_failed_commit(txn_id);
                TransactionError::Wal(e.to_string())
            })?;

        // The decision is durable. Apply the operation log; adapter
        // failures here must not roll the transaction back.
        let result = self.apply_operations(txn_id);
        self.finish(txn_id, TransactionState::Committed);
        metrics().incr(names::TXN_COMMITTED);
        result
    }

    fn apply_operations(&self, txn_id: TransactionId) -> TransactionResult<()> {
        let ops: Vec<WriteOp> = self
            .active
            .get(&txn_id)
            .map(|txn| txn.operations.iter().map(|o| o.write.clone()).collect())
            .unwrap_or_default();

        let mut batch: Vec<WriteOp> = Vec::new();
        let mut batch_storage: Option<StorageType> = None;
        for op in ops {
            let storage = self.storage_of(&op.table);
            if batch_storage != Some(storage) {
                self.flush_batch(batch_storage, &mut batch)?;
                batch_storage = Some(storage);
            }
            batch.push(op);
        }
        self.flush_batch(batch_storage, &mut batch)
    }

    fn flush_batch(
        &self,
        storage: Option<StorageType>,
        batch: &mut Vec<WriteOp>,
    ) -> TransactionResult<()> {
        if let Some(storage) = storage {
            if !batch.is_empty() {
                let adapter = self.adapters.adapter(storage);
                write_with_retry(
                    adapter.as_ref(),
                    batch,
                    WRITE_RETRY_ATTEMPTS,
                    WRITE_RETRY_BACKOFF,
                )
                .map_err(|e| TransactionError::Wal(e.to_string()))?;
                batch.clear();
            }
        }
        Ok(())
    }

    /// Distributed path: the coordinator has already written the decision
    /// record and driven the participants; this just settles local state.
    pub fn finish_distributed(
        &self,
        txn_id: TransactionId,
        committed: bool,
    ) -> TransactionResult<()> {
        if !self.active.contains_key(&txn_id) {
            return Err(TransactionError::NotFound(txn_id));
        }
        let state = if committed {
            metrics().incr(names::TXN_COMMITTED);
            TransactionState::Committed
        } else {
            metrics().incr(names::TXN_ABORTED);
            TransactionState::Aborted
        };
        self.finish(txn_id, state);
        Ok(())
    }

    pub fn abort(&self, txn_id: TransactionId) -> TransactionResult<()> {
        let Some(mut txn) = self.active.get_mut(&txn_id) else {
            return Err(TransactionError::NotFound(txn_id));
        };
        if txn.state.is_terminal() {
            return Err(TransactionError::invalid_state(txn_id, txn.state, "abort"));
        }
        txn.state = TransactionState::Aborting;
        drop(txn);

        // Best effort: the abort record matters for recovery hygiene, but
        // lock release must happen regardless.
        if let Err(e) = self.wal.append(txn_id, WalOperation::Abort) {
            tracing::warn!(txn_id, error = %e, "failed to log ABORT record");
        }
        self.finish(txn_id, TransactionState::Aborted);
        metrics().incr(names::TXN_ABORTED);
        Ok(())
    }

    fn abort_after_failed_commit(&self, txn_id: TransactionId) -> TransactionResult<()> {
        if let Some(mut txn) = self.active.get_mut(&txn_id) {
            txn.state = TransactionState::Aborting;
        }
        if let Err(e) = self.wal.append(txn_id, WalOperation::Abort) {
            tracing::warn!(txn_id, error = %e, "failed to log ABORT record");
        }
        self.finish(txn_id, TransactionState::Aborted);
        metrics().incr(names::TXN_ABORTED);
        Ok(())
    }

    /// Terminal cleanup: a committed or aborted transaction holds no locks.
    fn finish(&self, txn_id: TransactionId, state: TransactionState) {
        if let Some(mut txn) = self.active.get_mut(&txn_id) {
            txn.state = state;
        }
        self.lock_manager.release_all(txn_id);
        self.predicates.remove_txn(txn_id);
        self.active.remove(&txn_id);
    }

    /// Abort transactions idle beyond the threshold; returns their ids.
    pub fn reap_idle(&self, idle_timeout: Duration) -> Vec<TransactionId> {
        let idle: Vec<TransactionId> = self
            .active
            .iter()
            .filter(|e| e.idle_for() >= idle_timeout || e.is_expired())
            .map(|e| *e.key())
            .collect();
        for txn_id in &idle {
            tracing::info!(txn_id, "aborting idle transaction");
            let _ = self.abort(*txn_id);
        }
        idle
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::{SyncMode, WalConfig};
    use tempfile::TempDir;

    fn setup() -> (TempDir, TransactionManager, Arc<AdapterRegistry>) {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(
            WalManager::open(WalConfig {
                dir: dir.path().join("wal"),
                segment_size: 64 * 1024 * 1024,
                sync_mode: SyncMode::GroupSync,
                sync_interval: Duration::from_millis(10),
            })
            .unwrap(),
        );
        let catalog = Arc::new(Catalog::new());
        let adapters = Arc::new(AdapterRegistry::new(Arc::clone(&catalog)));
        let lock_manager = Arc::new(LockManager::new(Duration::from_millis(200)));
        let manager = TransactionManager::new(
            wal,
            lock_manager,
            Arc::clone(&adapters),
            catalog,
            Duration::from_millis(200),
            Duration::from_secs(60),
            IsolationLevel::ReadCommitted,
        );
        (dir, manager, adapters)
    }

    fn insert(table: &str, key: &str, v: i64) -> WriteOp {
        WriteOp::insert(table, key, vec![Value::Integer(v)])
    }

    #[test]
    fn test_begin_commit_applies_writes() {
        let (_dir, tm, adapters) = setup();
        let txn = tm.begin(None, false).unwrap();
        tm.add_operation(txn, insert("t", "1", 10)).unwrap();
        tm.add_operation(txn, insert("t", "2", 20)).unwrap();

        // Nothing visible before commit.
        assert!(adapters
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap()
            .is_empty());

        tm.commit(txn).unwrap();
        assert!(!tm.is_active(txn));
        assert_eq!(
            adapters
                .adapter(StorageType::Kv)
                .scan("t", &[])
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_abort_discards_writes_and_locks() {
        let (_dir, tm, adapters) = setup();
        let txn = tm.begin(None, false).unwrap();
        tm.add_operation(txn, insert("t", "1", 10)).unwrap();
        tm.abort(txn).unwrap();

        assert!(adapters
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap()
            .is_empty());
        assert_eq!(tm.lock_manager().lock_count(txn), 0);
    }

    #[test]
    fn test_commit_twice_is_invalid_state() {
        let (_dir, tm, _) = setup();
        let txn = tm.begin(None, false).unwrap();
        tm.commit(txn).unwrap();
        assert!(matches!(
            tm.commit(txn),
            Err(TransactionError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_only_write_rejected_and_aborted() {
        let (_dir, tm, _) = setup();
        let txn = tm.begin(None, true).unwrap();
        let err = tm.add_operation(txn, insert("t", "1", 1)).unwrap_err();
        assert!(matches!(err, TransactionError::ReadOnly(_)));
        assert!(!tm.is_active(txn));
    }

    #[test]
    fn test_write_conflict_times_out() {
        let (_dir, tm, _) = setup();
        let t1 = tm.begin(None, false).unwrap();
        let t2 = tm.begin(None, false).unwrap();
        tm.add_operation(t1, insert("t", "1", 1)).unwrap();
        let err = tm.add_operation(t2, insert("t", "1", 2)).unwrap_err();
        assert!(matches!(err, TransactionError::LockTimeout { .. }));
        assert!(!tm.is_active(t2));
        tm.commit(t1).unwrap();
    }

    #[test]
    fn test_savepoint_rollback_truncates_ops() {
        let (_dir, tm, adapters) = setup();
        let txn = tm.begin(None, false).unwrap();
        tm.add_operation(txn, insert("t", "1", 1)).unwrap();
        tm.create_savepoint(txn, "s").unwrap();
        tm.add_operation(txn, insert("t", "2", 2)).unwrap();
        tm.rollback_to_savepoint(txn, "s").unwrap();
        tm.commit(txn).unwrap();

        let rows = adapters
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "1");
    }

    #[test]
    fn test_savepoint_rollback_releases_later_locks() {
        let (_dir, tm, _) = setup();
        let txn = tm.begin(None, false).unwrap();
        tm.add_operation(txn, insert("t", "1", 1)).unwrap();
        tm.create_savepoint(txn, "s").unwrap();
        tm.add_operation(txn, insert("t", "2", 2)).unwrap();
        assert!(tm.lock_manager().is_locked(&row_resource("t", "2")));
        tm.rollback_to_savepoint(txn, "s").unwrap();
        assert!(!tm.lock_manager().is_locked(&row_resource("t", "2")));
        assert!(tm.lock_manager().is_locked(&row_resource("t", "1")));
        tm.commit(txn).unwrap();
    }

    #[test]
    fn test_savepoint_duplicate_and_missing() {
        let (_dir, tm, _) = setup();
        let txn = tm.begin(None, false).unwrap();
        tm.create_savepoint(txn, "s").unwrap();
        assert!(matches!(
            tm.create_savepoint(txn, "s"),
            Err(TransactionError::SavepointExists { .. })
        ));
        assert!(matches!(
            tm.rollback_to_savepoint(txn, "missing"),
            Err(TransactionError::SavepointNotFound { .. })
        ));
        tm.release_savepoint(txn, "s").unwrap();
        assert!(matches!(
            tm.rollback_to_savepoint(txn, "s"),
            Err(TransactionError::SavepointNotFound { .. })
        ));
    }

    #[test]
    fn test_canonical_predicate_deterministic() {
        use crate::storage::QualOp;
        let quals_a = vec![
            ScanQual {
                column: "k".to_string(),
                op: QualOp::Lt,
                value: Value::Integer(10),
            },
            ScanQual {
                column: "a".to_string(),
                op: QualOp::GtEq,
                value: Value::Integer(0),
            },
        ];
        let quals_b: Vec<ScanQual> = quals_a.iter().rev().cloned().collect();
        let (key_a, _) = canonical_predicate("t", &quals_a);
        let (key_b, _) = canonical_predicate("t", &quals_b);
        assert_eq!(key_a, key_b);
        assert_eq!(key_a, "pred:t:a:[0,+inf)&k:(-inf,10)");
    }

    #[test]
    fn test_serializable_predicate_blocks_matching_writer() {
        use crate::storage::QualOp;
        let (_dir, tm, _) = setup();

        let reader = tm.begin(Some(IsolationLevel::Serializable), false).unwrap();
        tm.lock_for_scan(
            reader,
            "t",
            &[ScanQual {
                column: "c0".to_string(),
                op: QualOp::Lt,
                value: Value::Integer(10),
            }],
        )
        .unwrap();

        // Writer inserting a row inside the range times out while the
        // reader lives (no schema registered, so the match is
        // conservative).
        let writer = tm.begin(None, false).unwrap();
        let err = tm.add_operation(writer, insert("t", "5", 5)).unwrap_err();
        assert!(matches!(err, TransactionError::LockTimeout { .. }));

        tm.commit(reader).unwrap();

        // A fresh writer proceeds once the predicate is gone.
        let writer2 = tm.begin(None, false).unwrap();
        tm.add_operation(writer2, insert("t", "5", 5)).unwrap();
        tm.commit(writer2).unwrap();
    }

    #[test]
    fn test_read_committed_statement_locks_released() {
        let (_dir, tm, _) = setup();
        let txn = tm.begin(Some(IsolationLevel::ReadCommitted), false).unwrap();
        tm.lock_for_read(txn, "t", "1").unwrap();
        assert!(tm.lock_manager().is_locked(&row_resource("t", "1")));
        tm.end_statement(txn);
        assert!(!tm.lock_manager().is_locked(&row_resource("t", "1")));
        tm.commit(txn).unwrap();
    }

    #[test]
    fn test_repeatable_read_locks_held_to_commit() {
        let (_dir, tm, _) = setup();
        let txn = tm
            .begin(Some(IsolationLevel::RepeatableRead), false)
            .unwrap();
        tm.lock_for_read(txn, "t", "1").unwrap();
        tm.end_statement(txn);
        assert!(tm.lock_manager().is_locked(&row_resource("t", "1")));
        tm.commit(txn).unwrap();
        assert!(!tm.lock_manager().is_locked(&row_resource("t", "1")));
    }

    #[test]
    fn test_reap_idle_aborts() {
        let (_dir, tm, _) = setup();
        let txn = tm.begin(None, false).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let reaped = tm.reap_idle(Duration::from_millis(10));
        assert_eq!(reaped, vec![txn]);
        assert!(!tm.is_active(txn));
    }
}
