// Two-phase commit across storage participants.
//
// The coordinator's own WAL is the source of truth: a PREPARE intent is
// logged before any vote is requested, and the COMMIT decision is logged
// (and synced) before any participant is told to commit. A participant
// commit failure is retried with backoff rather than rolled back, because
// the logged decision is authoritative. After a crash, every prepared
// transaction without a durable decision resolves to ABORT.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::common::TransactionId;
use crate::monitoring::metrics::{metrics, names};
use crate::storage::{AdapterRegistry, StorageAdapter, StorageType, WriteOp};

use super::error::{TransactionError, TransactionResult};
use super::wal::{WalManager, WalOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Aborted,
}

/// A commit participant. All three operations are idempotent; `commit` and
/// `abort` after the fact must succeed as no-ops.
pub trait Participant: Send + Sync {
    fn id(&self) -> &str;
    fn prepare(&self, txn_id: TransactionId) -> TransactionResult<Vote>;
    fn commit(&self, txn_id: TransactionId) -> TransactionResult<()>;
    fn abort(&self, txn_id: TransactionId) -> TransactionResult<()>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Per-participant prepare deadline.
    pub prepare_timeout: Duration,
    /// Commit retry attempts before giving up the retry loop.
    pub commit_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            commit_retries: 5,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CoordinatorStats {
    pub committed: u64,
    pub aborted: u64,
    pub prepare_failures: u64,
}

pub struct DistributedCoordinator {
    wal: Arc<WalManager>,
    config: CoordinatorConfig,
    stats: RwLock<CoordinatorStats>,
}

impl DistributedCoordinator {
    pub fn new(wal: Arc<WalManager>, config: CoordinatorConfig) -> Self {
        Self {
            wal,
            config,
            stats: RwLock::new(CoordinatorStats::default()),
        }
    }

    /// Run the full protocol for one transaction. The caller has already
    /// staged the transaction's writes into each participant.
    pub fn execute(
        &self,
        txn_id: TransactionId,
        participants: &[Arc<dyn Participant>],
    ) -> TransactionResult<Outcome> {
        if participants.is_empty() {
            return Err(TransactionError::Coordination {
                txn_id,
                reason: "no participants registered".to_string(),
            });
        }

        // Intent first: recovery must know who was asked.
        let ids: Vec<String> = participants.iter().map(|p| p.id().to_string()).collect();
        self.wal
            .append(txn_id, WalOperation::TwoPhasePrepare { participants: ids })
            .and_then(|_| self.wal.sync())
            .map_err(|e| TransactionError::Wal(e.to_string()))?;

        if !self.prepare_round(txn_id, participants) {
            self.decide_abort(txn_id, participants)?;
            return Ok(Outcome::Aborted);
        }

        // Unanimous yes: the durable COMMIT record is the decision.
        self.wal
            .append(txn_id, WalOperation::Commit)
            .and_then(|_| self.wal.sync())
            .map_err(|e| {
                // Decision never became durable; the safe resolution is
                // abort on every participant.
                let _ = self.abort_all(txn_id, participants);
                TransactionError::Wal(e.to_string())
            })?;

        self.commit_all(txn_id, participants);
        self.stats.write().committed += 1;
        metrics().incr(names::DTXN_COMMITTED);
        Ok(Outcome::Committed)
    }

    /// Parallel vote collection; any no, error, or timeout fails the round.
    fn prepare_round(
        &self,
        txn_id: TransactionId,
        participants: &[Arc<dyn Participant>],
    ) -> bool {
        let (tx, rx) = crossbeam::channel::bounded(participants.len());
        std::thread::scope(|scope| {
            for participant in participants {
                let tx = tx.clone();
                let participant = Arc::clone(participant);
                scope.spawn(move || {
                    let vote = participant.prepare(txn_id);
                    let _ = tx.send((participant.id().to_string(), vote));
                });
            }
            drop(tx);

            let deadline = std::time::Instant::now() + self.config.prepare_timeout;
            let mut yes_votes = 0;
            while yes_votes < participants.len() {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok((_, Ok(Vote::Yes))) => yes_votes += 1,
                    Ok((id, Ok(Vote::No))) => {
                        tracing::warn!(txn_id, participant = %id, "participant voted no");
                        self.stats.write().prepare_failures += 1;
                        return false;
                    }
                    Ok((id, Err(e))) => {
                        tracing::warn!(txn_id, participant = %id, error = %e, "prepare failed");
                        self.stats.write().prepare_failures += 1;
                        return false;
                    }
                    Err(_) => {
                        tracing::warn!(txn_id, "prepare round timed out");
                        self.stats.write().prepare_failures += 1;
                        return false;
                    }
                }
            }
            true
        })
    }

    fn decide_abort(
        &self,
        txn_id: TransactionId,
        participants: &[Arc<dyn Participant>],
    ) -> TransactionResult<()> {
        self.wal
            .append(txn_id, WalOperation::Abort)
            .and_then(|_| self.wal.sync())
            .map_err(|e| TransactionError::Wal(e.to_string()))?;
        self.abort_all(txn_id, participants);
        self.stats.write().aborted += 1;
        metrics().incr(names::DTXN_ABORTED);
        Ok(())
    }

    /// Commit every participant, retrying with jittered backoff. The
    /// decision is logged, so a participant failure is never a rollback.
    fn commit_all(&self, txn_id: TransactionId, participants: &[Arc<dyn Participant>]) {
        for participant in participants {
            let mut backoff = self.config.retry_backoff;
            let mut attempt = 0;
            loop {
                match participant.commit(txn_id) {
                    Ok(()) => break,
                    Err(e) if attempt < self.config.commit_retries => {
                        attempt += 1;
                        tracing::warn!(
                            txn_id,
                            participant = %participant.id(),
                            attempt,
                            error = %e,
                            "participant commit failed, retrying"
                        );
                        let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
                        std::thread::sleep(backoff + Duration::from_millis(jitter));
                        backoff *= 2;
                    }
                    Err(e) => {
                        // The durable decision still stands; recovery will
                        // re-drive this participant.
                        tracing::error!(
                            txn_id,
                            participant = %participant.id(),
                            error = %e,
                            "participant commit exhausted retries"
                        );
                        break;
                    }
                }
            }
        }
    }

    fn abort_all(&self, txn_id: TransactionId, participants: &[Arc<dyn Participant>]) {
        for participant in participants {
            if let Err(e) = participant.abort(txn_id) {
                tracing::warn!(txn_id, participant = %participant.id(), error = %e, "participant abort failed");
            }
        }
    }

    /// Crash resolution: drive every in-doubt transaction to the durable
    /// decision. Without a logged COMMIT the decision is ABORT.
    pub fn resolve_in_doubt(
        &self,
        in_doubt: &[(TransactionId, Vec<String>)],
        lookup: impl Fn(&str) -> Option<Arc<dyn Participant>>,
    ) {
        for (txn_id, participant_ids) in in_doubt {
            tracing::info!(txn_id, "resolving in-doubt distributed transaction to ABORT");
            for id in participant_ids {
                if let Some(participant) = lookup(id) {
                    if let Err(e) = participant.abort(*txn_id) {
                        tracing::warn!(txn_id, participant = %id, error = %e, "in-doubt abort failed");
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.read().clone()
    }
}

// ============================================================================
// Adapter participant
// ============================================================================

/// Wraps one storage adapter as a commit participant. Writes are staged at
/// prepare-registration time and only reach the adapter on commit; abort
/// drops the stage. Commit after the stage is gone is a no-op, which is
/// what makes re-delivery during coordinator recovery safe.
pub struct AdapterParticipant {
    name: String,
    adapter: Arc<dyn StorageAdapter>,
    staged: Mutex<HashMap<TransactionId, Vec<WriteOp>>>,
    /// Test hook: force the next prepare to vote no.
    fail_next_prepare: Mutex<bool>,
}

impl AdapterParticipant {
    pub fn new(storage: StorageType, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            name: storage.to_string(),
            adapter,
            staged: Mutex::new(HashMap::new()),
            fail_next_prepare: Mutex::new(false),
        }
    }

    pub fn from_registry(registry: &AdapterRegistry, storage: StorageType) -> Self {
        Self::new(storage, registry.adapter(storage))
    }

    pub fn stage(&self, txn_id: TransactionId, ops: Vec<WriteOp>) {
        self.staged.lock().entry(txn_id).or_default().extend(ops);
    }

    pub fn inject_prepare_failure(&self) {
        *self.fail_next_prepare.lock() = true;
    }
}

impl Participant for AdapterParticipant {
    fn id(&self) -> &str {
        &self.name
    }

    fn prepare(&self, txn_id: TransactionId) -> TransactionResult<Vote> {
        if std::mem::take(&mut *self.fail_next_prepare.lock()) {
            return Ok(Vote::No);
        }
        // Staged and writable: ready to commit.
        if self.staged.lock().contains_key(&txn_id) {
            Ok(Vote::Yes)
        } else {
            Ok(Vote::No)
        }
    }

    fn commit(&self, txn_id: TransactionId) -> TransactionResult<()> {
        let ops = self.staged.lock().remove(&txn_id);
        if let Some(ops) = ops {
            self.adapter
                .batch_write(&ops)
                .map_err(|e| TransactionError::ParticipantFailure {
                    participant: self.name.clone(),
                    phase: "commit",
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn abort(&self, txn_id: TransactionId) -> TransactionResult<()> {
        self.staged.lock().remove(&txn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::common::Value;
    use crate::transaction::wal::{SyncMode, WalConfig};
    use tempfile::TempDir;

    fn coordinator() -> (TempDir, DistributedCoordinator, Arc<AdapterRegistry>) {
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
        let registry = Arc::new(AdapterRegistry::new(Arc::new(Catalog::new())));
        (
            dir,
            DistributedCoordinator::new(wal, CoordinatorConfig::default()),
            registry,
        )
    }

    fn staged_participant(
        registry: &AdapterRegistry,
        storage: StorageType,
        txn_id: TransactionId,
        key: &str,
    ) -> Arc<AdapterParticipant> {
        let participant = Arc::new(AdapterParticipant::from_registry(registry, storage));
        participant.stage(
            txn_id,
            vec![WriteOp::insert("t", key, vec![Value::Integer(1)])],
        );
        participant
    }

    #[test]
    fn test_unanimous_yes_commits_both() {
        let (_dir, coord, registry) = coordinator();
        let kv = staged_participant(&registry, StorageType::Kv, 1, "k1");
        let col = staged_participant(&registry, StorageType::Columnar, 1, "c1");
        let participants: Vec<Arc<dyn Participant>> = vec![kv, col];

        let outcome = coord.execute(1, &participants).unwrap();
        assert_eq!(outcome, Outcome::Committed);
        assert_eq!(
            registry
                .adapter(StorageType::Kv)
                .scan("t", &[])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            registry
                .adapter(StorageType::Columnar)
                .scan("t", &[])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_no_vote_aborts_everything() {
        let (_dir, coord, registry) = coordinator();
        let kv = staged_participant(&registry, StorageType::Kv, 2, "k1");
        let col = staged_participant(&registry, StorageType::Columnar, 2, "c1");
        col.inject_prepare_failure();
        let participants: Vec<Arc<dyn Participant>> = vec![kv, col];

        let outcome = coord.execute(2, &participants).unwrap();
        assert_eq!(outcome, Outcome::Aborted);
        // Neither engine has visible rows from the statement.
        assert!(registry
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap()
            .is_empty());
        assert!(registry
            .adapter(StorageType::Columnar)
            .scan("t", &[])
            .unwrap()
            .is_empty());
        assert_eq!(coord.stats().aborted, 1);
    }

    #[test]
    fn test_participant_operations_idempotent() {
        let (_dir, _coord, registry) = coordinator();
        let participant = staged_participant(&registry, StorageType::Kv, 3, "k1");
        participant.commit(3).unwrap();
        participant.commit(3).unwrap();
        participant.abort(3).unwrap();
        assert_eq!(
            registry
                .adapter(StorageType::Kv)
                .scan("t", &[])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_unstaged_participant_votes_no() {
        let (_dir, _coord, registry) = coordinator();
        let participant = AdapterParticipant::from_registry(&registry, StorageType::Kv);
        assert_eq!(participant.prepare(99).unwrap(), Vote::No);
    }

    #[test]
    fn test_resolve_in_doubt_aborts() {
        let (_dir, coord, registry) = coordinator();
        let participant = staged_participant(&registry, StorageType::Kv, 4, "k1");
        let lookup_target: Arc<dyn Participant> = Arc::clone(&participant) as Arc<dyn Participant>;

        coord.resolve_in_doubt(&[(4, vec!["kv".to_string()])], |id| {
            (id == "kv").then(|| Arc::clone(&lookup_target))
        });
        // The stage is gone; a later commit re-delivery is a no-op.
        participant.commit(4).unwrap();
        assert!(registry
            .adapter(StorageType::Kv)
            .scan("t", &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_prepare_intent_logged_before_votes() {
        let (dir, coord, registry) = coordinator();
        let kv = staged_participant(&registry, StorageType::Kv, 5, "k1");
        let participants: Vec<Arc<dyn Participant>> = vec![kv];
        coord.execute(5, &participants).unwrap();

        let (entries, _) =
            WalManager::read_segments(&dir.path().join("wal")).unwrap();
        let prepare_pos = entries
            .iter()
            .position(|e| matches!(e.op, WalOperation::TwoPhasePrepare { .. }))
            .unwrap();
        let commit_pos = entries
            .iter()
            .position(|e| matches!(e.op, WalOperation::Commit))
            .unwrap();
        assert!(prepare_pos < commit_pos);
    }
}
