// Engine-wide error type.
//
// Every error surfaced by the engine maps onto one of these kinds; the
// monitoring registry keeps a typed counter per kind (see
// `monitoring::record_error`). Subsystems with richer internal errors
// (`transaction::error::TransactionError`) convert into `DbError` at the
// module boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("syntax error at line {line}, column {column} near '{near}'{}", suggestion_suffix(.suggestion))]
    SyntaxError {
        line: u32,
        column: u32,
        near: String,
        suggestion: Option<String>,
    },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("lock timeout")]
    LockTimeout,

    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    #[error("durability failure: {0}")]
    DurabilityFailure(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("statement cancelled: {0}")]
    Cancelled(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable kind name used as the monitoring counter suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::SyntaxError { .. } => "syntax",
            DbError::ValidationError(_) => "validation",
            DbError::LockTimeout => "lock_timeout",
            DbError::IsolationViolation(_) => "isolation_violation",
            DbError::DurabilityFailure(_) => "durability_failure",
            DbError::Corruption(_) => "corruption",
            DbError::InvalidState(_) => "invalid_state",
            DbError::StorageError(_) => "storage",
            DbError::Execution(_) => "execution",
            DbError::Cancelled(_) => "cancelled",
            DbError::Catalog(_) => "catalog",
            DbError::NotFound(_) => "not_found",
            DbError::AlreadyExists(_) => "already_exists",
            DbError::Serialization(_) => "serialization",
            DbError::Io(_) => "io",
            DbError::Internal(_) => "internal",
        }
    }

    /// Errors that poison the engine for writes until a recovery cycle runs.
    pub fn halts_writes(&self) -> bool {
        matches!(
            self,
            DbError::DurabilityFailure(_) | DbError::Corruption(_)
        )
    }

    pub fn syntax(line: u32, column: u32, near: impl Into<String>) -> Self {
        DbError::SyntaxError {
            line,
            column,
            near: near.into(),
            suggestion: None,
        }
    }
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{}'?)", s),
        None => String::new(),
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = DbError::syntax(3, 14, "SELEC");
        assert_eq!(
            err.to_string(),
            "syntax error at line 3, column 14 near 'SELEC'"
        );
    }

    #[test]
    fn test_syntax_error_with_suggestion() {
        let err = DbError::SyntaxError {
            line: 1,
            column: 1,
            near: "SELEC".to_string(),
            suggestion: Some("SELECT".to_string()),
        };
        assert!(err.to_string().contains("did you mean 'SELECT'"));
    }

    #[test]
    fn test_kind_names_stable() {
        assert_eq!(DbError::LockTimeout.kind(), "lock_timeout");
        assert_eq!(DbError::Corruption("x".into()).kind(), "corruption");
    }

    #[test]
    fn test_halts_writes() {
        assert!(DbError::DurabilityFailure("sync".into()).halts_writes());
        assert!(DbError::Corruption("crc".into()).halts_writes());
        assert!(!DbError::LockTimeout.halts_writes());
    }
}
