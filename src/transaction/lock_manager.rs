// Lock manager.
//
// Row- and table-scoped shared/exclusive locks with FIFO wait queues.
// Deadlocks are not detected by cycle search; every request carries a
// timeout and the transaction whose acquisition times out is expected to
// abort. Each timeout bumps the `lock.deadlock_timeouts` counter so a
// monitoring audit can surface deadlock-like pathologies.
//
// The lock table is a concurrent map keyed by resource id; wait-queue
// operations hold the per-entry mutex and wake waiters through the
// per-entry condvar.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::common::TransactionId;
use crate::monitoring::metrics::{metrics, names};

use super::error::{TransactionError, TransactionResult};
use super::types::LockMode;

#[derive(Debug, Clone)]
struct Waiter {
    txn_id: TransactionId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    holders: Vec<(TransactionId, LockMode)>,
    waiters: VecDeque<Waiter>,
    /// Set when the entry was removed from the table; stale handles must
    /// re-fetch instead of waiting on a dead queue.
    retired: bool,
}

impl LockState {
    fn holder_mode(&self, txn_id: TransactionId) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(id, _)| *id == txn_id)
            .map(|(_, m)| *m)
    }

    fn compatible_with_holders(&self, txn_id: TransactionId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .all(|(id, held)| *id == txn_id || mode.is_compatible(held))
    }

    fn position(&self, txn_id: TransactionId) -> Option<usize> {
        self.waiters.iter().position(|w| w.txn_id == txn_id)
    }
}

struct LockEntry {
    state: Mutex<LockState>,
    cv: Condvar,
}

enum Attempt {
    Granted,
    TimedOut,
    Retired,
}

pub struct LockManager {
    table: DashMap<String, Arc<LockEntry>>,
    /// Resources per transaction, in acquisition order.
    txn_locks: DashMap<TransactionId, Vec<String>>,
    default_timeout: Duration,
}

impl LockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            table: DashMap::new(),
            txn_locks: DashMap::new(),
            default_timeout,
        }
    }

    pub fn acquire(
        &self,
        txn_id: TransactionId,
        resource: &str,
        mode: LockMode,
    ) -> TransactionResult<()> {
        self.acquire_with_timeout(txn_id, resource, mode, self.default_timeout)
    }

    /// Block until the request is compatible with current holders or the
    /// timeout elapses. Re-requests of an already held compatible mode are
    /// no-ops; a Shared→Exclusive upgrade succeeds immediately when the
    /// transaction is the sole holder and otherwise waits at the queue
    /// front.
    pub fn acquire_with_timeout(
        &self,
        txn_id: TransactionId,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> TransactionResult<()> {
        let start = Instant::now();
        loop {
            let entry = self.entry(resource);
            match self.try_on_entry(&entry, txn_id, mode, start, timeout) {
                Attempt::Granted => {
                    let waited = start.elapsed();
                    if !waited.is_zero() {
                        metrics().incr_by(names::LOCK_WAIT_MICROS, waited.as_micros() as u64);
                    }
                    self.txn_locks
                        .entry(txn_id)
                        .or_default()
                        .push(resource.to_string());
                    return Ok(());
                }
                Attempt::TimedOut => {
                    metrics().incr(names::LOCK_TIMEOUTS);
                    tracing::warn!(txn_id, resource, %mode, "lock wait timed out");
                    return Err(TransactionError::LockTimeout {
                        txn_id,
                        resource: resource.to_string(),
                        mode,
                    });
                }
                // Entry vanished while we held a handle to it.
                Attempt::Retired => continue,
            }
        }
    }

    fn entry(&self, resource: &str) -> Arc<LockEntry> {
        if let Some(entry) = self.table.get(resource) {
            return Arc::clone(&entry);
        }
        self.table
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(LockEntry {
                    state: Mutex::new(LockState::default()),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    fn try_on_entry(
        &self,
        entry: &LockEntry,
        txn_id: TransactionId,
        mode: LockMode,
        start: Instant,
        timeout: Duration,
    ) -> Attempt {
        let mut state = entry.state.lock();
        loop {
            if state.retired {
                return Attempt::Retired;
            }

            if let Some(held) = state.holder_mode(txn_id) {
                if mode.strength() <= held.strength() {
                    // Re-request of a held compatible mode.
                    state.waiters.retain(|w| w.txn_id != txn_id);
                    return Attempt::Granted;
                }
                // Upgrade: immediate when sole holder, else wait at the
                // front of the queue so the upgrade cannot starve.
                if state.holders.len() == 1 {
                    state.holders[0].1 = mode;
                    state.waiters.retain(|w| w.txn_id != txn_id);
                    return Attempt::Granted;
                }
                if state.position(txn_id).is_none() {
                    state.waiters.push_front(Waiter { txn_id, mode });
                }
            } else {
                let front = state.position(txn_id).map(|p| p == 0).unwrap_or(
                    // FIFO fairness: newcomers only bypass the queue when
                    // nobody is waiting at all.
                    state.waiters.is_empty(),
                );
                if front && state.compatible_with_holders(txn_id, mode) {
                    state.waiters.retain(|w| w.txn_id != txn_id);
                    state.holders.push((txn_id, mode));
                    // The next queued request may be compatible too.
                    entry.cv.notify_all();
                    return Attempt::Granted;
                }
                if state.position(txn_id).is_none() {
                    state.waiters.push_back(Waiter { txn_id, mode });
                }
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                state.waiters.retain(|w| w.txn_id != txn_id);
                return Attempt::TimedOut;
            }
            entry.cv.wait_for(&mut state, remaining);
        }
    }

    /// Release one resource; wakes the wait queue.
    pub fn release(&self, txn_id: TransactionId, resource: &str) {
        if let Some(entry) = self.table.get(resource).map(|e| Arc::clone(&e)) {
            let mut state = entry.state.lock();
            state.holders.retain(|(id, _)| *id != txn_id);
            state.waiters.retain(|w| w.txn_id != txn_id);
            if state.holders.is_empty() && state.waiters.is_empty() {
                state.retired = true;
                drop(state);
                self.table
                    .remove_if(resource, |_, e| Arc::ptr_eq(e, &entry));
            } else {
                entry.cv.notify_all();
            }
        }
        if let Some(mut held) = self.txn_locks.get_mut(&txn_id) {
            held.retain(|r| r != resource);
        }
    }

    /// Release every lock a transaction holds. Called on commit and abort;
    /// a terminated transaction holds no locks.
    pub fn release_all(&self, txn_id: TransactionId) {
        let resources = self
            .txn_locks
            .remove(&txn_id)
            .map(|(_, r)| r)
            .unwrap_or_default();
        for resource in resources {
            if let Some(entry) = self.table.get(&resource).map(|e| Arc::clone(&e)) {
                let mut state = entry.state.lock();
                state.holders.retain(|(id, _)| *id != txn_id);
                state.waiters.retain(|w| w.txn_id != txn_id);
                if state.holders.is_empty() && state.waiters.is_empty() {
                    state.retired = true;
                    drop(state);
                    self.table
                        .remove_if(&resource, |_, e| Arc::ptr_eq(e, &entry));
                } else {
                    entry.cv.notify_all();
                }
            }
        }
    }

    /// Resources held by a transaction, in acquisition order.
    pub fn held(&self, txn_id: TransactionId) -> Vec<String> {
        self.txn_locks
            .get(&txn_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn lock_count(&self, txn_id: TransactionId) -> usize {
        self.txn_locks.get(&txn_id).map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.table
            .get(resource)
            .map(|e| !e.state.lock().holders.is_empty())
            .unwrap_or(false)
    }

    pub fn holders(&self, resource: &str) -> Vec<(TransactionId, LockMode)> {
        self.table
            .get(resource)
            .map(|e| e.state.lock().holders.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locked_resources", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_millis(200))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Shared).unwrap();
        lm.acquire(2, "r1", LockMode::Shared).unwrap();
        assert_eq!(lm.holders("r1").len(), 2);
    }

    #[test]
    fn test_exclusive_conflicts_and_times_out() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Exclusive).unwrap();
        let err = lm
            .acquire_with_timeout(2, "r1", LockMode::Shared, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, TransactionError::LockTimeout { .. }));
    }

    #[test]
    fn test_rerequest_is_noop() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Shared).unwrap();
        lm.acquire(1, "r1", LockMode::Shared).unwrap();
        assert_eq!(lm.holders("r1").len(), 1);
        assert_eq!(lm.lock_count(1), 2); // two acquisition records, one holder
    }

    #[test]
    fn test_upgrade_when_sole_holder() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Shared).unwrap();
        lm.acquire(1, "r1", LockMode::Exclusive).unwrap();
        assert_eq!(lm.holders("r1"), vec![(1, LockMode::Exclusive)]);
    }

    #[test]
    fn test_upgrade_blocked_by_other_reader() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Shared).unwrap();
        lm.acquire(2, "r1", LockMode::Shared).unwrap();
        let err = lm
            .acquire_with_timeout(1, "r1", LockMode::Exclusive, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, TransactionError::LockTimeout { .. }));
    }

    #[test]
    fn test_release_all_clears_everything() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Shared).unwrap();
        lm.acquire(1, "r2", LockMode::Exclusive).unwrap();
        assert_eq!(lm.lock_count(1), 2);
        lm.release_all(1);
        assert_eq!(lm.lock_count(1), 0);
        assert!(!lm.is_locked("r1"));
        assert!(!lm.is_locked("r2"));
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let lm = Arc::new(LockManager::new(Duration::from_secs(5)));
        lm.acquire(1, "r1", LockMode::Exclusive).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || {
            lm2.acquire_with_timeout(2, "r1", LockMode::Exclusive, Duration::from_secs(2))
        });

        thread::sleep(Duration::from_millis(50));
        lm.release_all(1);
        waiter.join().unwrap().unwrap();
        assert_eq!(lm.holders("r1"), vec![(2, LockMode::Exclusive)]);
    }

    #[test]
    fn test_fifo_no_barging_past_exclusive_waiter() {
        let lm = Arc::new(LockManager::new(Duration::from_secs(5)));
        lm.acquire(1, "r1", LockMode::Shared).unwrap();

        // Txn 2 queues for exclusive behind the reader.
        let lm2 = Arc::clone(&lm);
        let writer = thread::spawn(move || {
            lm2.acquire_with_timeout(2, "r1", LockMode::Exclusive, Duration::from_secs(2))
        });
        thread::sleep(Duration::from_millis(50));

        // A late shared request must not barge past the queued writer.
        let err = lm.acquire_with_timeout(3, "r1", LockMode::Shared, Duration::from_millis(50));
        assert!(err.is_err());

        lm.release_all(1);
        writer.join().unwrap().unwrap();
        lm.release_all(2);
    }

    #[test]
    fn test_exclusive_holder_excludes_all() {
        let lm = manager();
        lm.acquire(1, "r1", LockMode::Exclusive).unwrap();
        assert!(lm
            .acquire_with_timeout(2, "r1", LockMode::Exclusive, Duration::from_millis(40))
            .is_err());
        let holders = lm.holders("r1");
        assert_eq!(holders.len(), 1);
    }
}
