// Core transaction types.
//
// The isolation enum carries its own conversion table to lock discipline;
// the lock manager itself only ever sees Shared/Exclusive.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::common::{Lsn, TransactionId};
use crate::storage::WriteOp;

/// Isolation level for transactions, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl IsolationLevel {
    /// Whether reads take shared locks at all.
    pub fn locks_reads(&self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// Whether shared read locks are held to transaction end rather than
    /// statement end.
    pub fn holds_read_locks(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Whether scans additionally take predicate (range) locks.
    pub fn locks_predicates(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

/// Transaction lifecycle state. Progresses Active → (Preparing →)?
/// {Committed, Aborted}; never reverses. Aborting is the transient state a
/// deadline expiry puts the transaction in before its ABORT record lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Preparing,
    Aborting,
    Committed,
    Aborted,
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Lock mode: Shared is compatible with Shared only; Exclusive with nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    pub fn strength(&self) -> u8 {
        match self {
            LockMode::Shared => 1,
            LockMode::Exclusive => 2,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// One logged mutation in a transaction's operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnOperation {
    pub write: WriteOp,
    pub lsn: Lsn,
}

/// Savepoints are flat snapshots inside the owning transaction, not nested
/// transactions: operation-log length, held-lock high-water mark, and the
/// WAL position at creation time.
#[derive(Debug, Clone)]
pub struct SavepointSnapshot {
    pub name: String,
    pub op_len: usize,
    pub lock_mark: usize,
    pub lsn: Lsn,
}

/// Transaction metadata and its operation log.
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub start_time: SystemTime,
    pub last_activity: Instant,
    pub deadline: Option<Instant>,
    pub operations: Vec<TxnOperation>,
    /// Resources in acquisition order; savepoints snapshot the length.
    pub held_locks: Vec<String>,
    /// Shared locks scoped to the current statement (ReadCommitted).
    pub statement_locks: Vec<String>,
    pub savepoints: Vec<SavepointSnapshot>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation: IsolationLevel, read_only: bool) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            isolation,
            read_only,
            start_time: SystemTime::now(),
            last_activity: Instant::now(),
            deadline: None,
            operations: Vec::new(),
            held_locks: Vec::new(),
            statement_locks: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn record_lock(&mut self, resource: &str) {
        if !self.held_locks.iter().any(|r| r == resource) {
            self.held_locks.push(resource.to_string());
        }
    }

    pub fn savepoint(&self, name: &str) -> Option<&SavepointSnapshot> {
        self.savepoints.iter().find(|sp| sp.name == name)
    }
}
