// Transaction management.
//
// The ACID core: per-transaction state and operation logs, two-phase
// locking with timeout-broken deadlocks, the write-ahead log, analysis-based
// crash recovery, and two-phase commit across heterogeneous storage
// participants.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | `Transaction`, `IsolationLevel`, `LockMode`, savepoints |
// | [`error`] | Transaction-specific error types |
// | [`lock_manager`] | Shared/exclusive locks, FIFO queues, timeouts |
// | [`wal`] | Segmented append-only log, LSNs, checksums, rotation |
// | [`recovery`] | Log analysis, classification, idempotent replay |
// | [`manager`] | Lifecycle, isolation discipline, commit protocol |
// | [`two_phase_commit`] | Distributed commit coordination |

pub mod error;
pub mod lock_manager;
pub mod manager;
pub mod recovery;
pub mod two_phase_commit;
pub mod types;
pub mod wal;

pub use error::{TransactionError, TransactionResult};
pub use lock_manager::LockManager;
pub use manager::{canonical_predicate, row_resource, TransactionManager};
pub use recovery::{IntegrityReport, RecoveryManager, RecoveryPlan};
pub use two_phase_commit::{
    AdapterParticipant, CoordinatorConfig, DistributedCoordinator, Outcome, Participant, Vote,
};
pub use types::{
    IsolationLevel, LockMode, SavepointSnapshot, Transaction, TransactionState, TxnOperation,
};
pub use wal::{
    IntegrityIssue, SyncMode, WalConfig, WalEntry, WalManager, WalOperation, WalStats,
};
