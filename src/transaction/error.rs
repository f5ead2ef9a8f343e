//! Transaction-specific error types.
//!
//! Structured errors for the transaction subsystem; each converts into the
//! engine-wide `DbError` at the module boundary, mapping onto the error
//! kinds the engine surfaces (LockTimeout, IsolationViolation,
//! DurabilityFailure, InvalidState, ...).

use thiserror::Error;

use crate::common::TransactionId;
use crate::error::DbError;

use super::types::{LockMode, TransactionState};

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Error)]
pub enum TransactionError {
    /// Lock acquisition timed out; deadlocks surface this way.
    #[error("transaction {txn_id} timed out waiting for {mode} lock on '{resource}'")]
    LockTimeout {
        txn_id: TransactionId,
        resource: String,
        mode: LockMode,
    },

    #[error("transaction {0} not found")]
    NotFound(TransactionId),

    #[error("transaction {txn_id} is {state:?}; cannot {operation}")]
    InvalidState {
        txn_id: TransactionId,
        state: TransactionState,
        operation: &'static str,
    },

    #[error("transaction {0} is read-only; write operation not permitted")]
    ReadOnly(TransactionId),

    #[error("savepoint '{name}' not found in transaction {txn_id}")]
    SavepointNotFound {
        txn_id: TransactionId,
        name: String,
    },

    #[error("savepoint '{name}' already exists in transaction {txn_id}")]
    SavepointExists {
        txn_id: TransactionId,
        name: String,
    },

    #[error("transaction {txn_id} exceeded its deadline")]
    Expired { txn_id: TransactionId },

    #[error("write-ahead log failure: {0}")]
    Wal(String),

    #[error("participant '{participant}' failed during {phase}: {reason}")]
    ParticipantFailure {
        participant: String,
        phase: &'static str,
        reason: String,
    },

    #[error("coordination error for transaction {txn_id}: {reason}")]
    Coordination {
        txn_id: TransactionId,
        reason: String,
    },
}

impl TransactionError {
    pub fn invalid_state(
        txn_id: TransactionId,
        state: TransactionState,
        operation: &'static str,
    ) -> Self {
        TransactionError::InvalidState {
            txn_id,
            state,
            operation,
        }
    }

    /// Whether a retry of the whole transaction may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransactionError::LockTimeout { .. } | TransactionError::Expired { .. }
        )
    }
}

impl From<TransactionError> for DbError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::LockTimeout { .. } => DbError::LockTimeout,
            TransactionError::ReadOnly(id) => DbError::IsolationViolation(format!(
                "read-only transaction {} attempted a write",
                id
            )),
            TransactionError::Wal(msg) => DbError::DurabilityFailure(msg),
            TransactionError::Expired { txn_id } => {
                DbError::Cancelled(format!("transaction {} exceeded its deadline", txn_id))
            }
            other @ (TransactionError::NotFound(_)
            | TransactionError::InvalidState { .. }
            | TransactionError::SavepointNotFound { .. }
            | TransactionError::SavepointExists { .. }) => {
                DbError::InvalidState(other.to_string())
            }
            other @ (TransactionError::ParticipantFailure { .. }
            | TransactionError::Coordination { .. }) => DbError::Execution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_maps_to_db_error() {
        let err = TransactionError::LockTimeout {
            txn_id: 1,
            resource: "row:t:1".to_string(),
            mode: LockMode::Exclusive,
        };
        assert!(err.is_retriable());
        assert!(matches!(DbError::from(err), DbError::LockTimeout));
    }

    #[test]
    fn test_read_only_maps_to_isolation_violation() {
        let err = TransactionError::ReadOnly(7);
        assert!(matches!(
            DbError::from(err),
            DbError::IsolationViolation(_)
        ));
    }

    #[test]
    fn test_invalid_state_display() {
        let err =
            TransactionError::invalid_state(3, TransactionState::Committed, "commit");
        assert!(err.to_string().contains("Committed"));
        assert!(matches!(DbError::from(err), DbError::InvalidState(_)));
    }
}
