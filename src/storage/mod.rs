// Storage adapter layer.
//
// A thin uniform façade over the heterogeneous engines. The executor and
// recovery rely on three properties only: scans return finite sequences of
// unified rows, writes become durable with the owning transaction's WAL
// sync, and re-delivered writes are idempotent. The reference adapters here
// are in-memory; real byte formats are the engines' business.

pub mod columnar;
pub mod document;
pub mod kv;

pub use columnar::ColumnarAdapter;
pub use document::DocumentAdapter;
pub use kv::KvAdapter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{Lsn, Row, Value};
use crate::error::{DbError, Result};

/// Storage engine discriminator; also drives distributed-commit participant
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Kv,
    Document,
    Columnar,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Kv => write!(f, "kv"),
            StorageType::Document => write!(f, "document"),
            StorageType::Columnar => write!(f, "columnar"),
        }
    }
}

impl StorageType {
    pub fn parse(s: &str) -> Option<StorageType> {
        match s.to_ascii_lowercase().as_str() {
            "kv" => Some(StorageType::Kv),
            "document" | "doc" => Some(StorageType::Document),
            "columnar" | "column" => Some(StorageType::Columnar),
            _ => None,
        }
    }
}

/// Simple pushed-down qualifier. Residual predicates stay with the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanQual {
    pub column: String,
    pub op: QualOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl QualOp {
    pub fn matches(&self, left: &Value, right: &Value) -> bool {
        match left.compare(right) {
            None => false,
            Some(ord) => match self {
                QualOp::Eq => ord == std::cmp::Ordering::Equal,
                QualOp::Lt => ord == std::cmp::Ordering::Less,
                QualOp::LtEq => ord != std::cmp::Ordering::Greater,
                QualOp::Gt => ord == std::cmp::Ordering::Greater,
                QualOp::GtEq => ord != std::cmp::Ordering::Less,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// One keyed mutation, as logged and as delivered to adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOp {
    pub table: String,
    pub key: String,
    pub kind: WriteKind,
    /// New row values for Insert/Update.
    pub values: Option<Vec<Value>>,
    /// Prior row values for Update/Delete.
    pub old: Option<Vec<Value>>,
    /// LSN of the logging operation; becomes the row version.
    pub version: Lsn,
}

impl WriteOp {
    pub fn insert(table: impl Into<String>, key: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            kind: WriteKind::Insert,
            values: Some(values),
            old: None,
            version: 0,
        }
    }

    pub fn update(
        table: impl Into<String>,
        key: impl Into<String>,
        values: Vec<Value>,
        old: Vec<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            kind: WriteKind::Update,
            values: Some(values),
            old: Some(old),
            version: 0,
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>, old: Vec<Value>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            kind: WriteKind::Delete,
            values: None,
            old: Some(old),
            version: 0,
        }
    }
}

/// Uniform adapter contract consumed by the executor, transaction manager,
/// and recovery. Implementations must accept re-delivered writes.
pub trait StorageAdapter: Send + Sync {
    fn storage_type(&self) -> StorageType;

    /// Finite sequence of unified rows, with pushed-down quals applied.
    fn scan(&self, table: &str, quals: &[ScanQual]) -> Result<Vec<Row>>;

    fn point_get(&self, table: &str, key: &str) -> Result<Option<Row>>;

    fn batch_write(&self, ops: &[WriteOp]) -> Result<()>;

    /// Next synthetic row key for tables without an explicit primary key.
    fn next_row_key(&self, table: &str) -> u64;
}

/// The three engines behind one routing point.
pub struct AdapterRegistry {
    kv: Arc<KvAdapter>,
    document: Arc<DocumentAdapter>,
    columnar: Arc<ColumnarAdapter>,
}

impl AdapterRegistry {
    pub fn new(catalog: Arc<crate::catalog::Catalog>) -> Self {
        Self {
            kv: Arc::new(KvAdapter::new()),
            document: Arc::new(DocumentAdapter::new(Arc::clone(&catalog))),
            columnar: Arc::new(ColumnarAdapter::new(catalog)),
        }
    }

    /// Concrete KV adapter, for its column-map registry.
    pub fn kv(&self) -> &Arc<KvAdapter> {
        &self.kv
    }

    pub fn adapter(&self, storage: StorageType) -> Arc<dyn StorageAdapter> {
        match storage {
            StorageType::Kv => Arc::clone(&self.kv) as Arc<dyn StorageAdapter>,
            StorageType::Document => Arc::clone(&self.document) as Arc<dyn StorageAdapter>,
            StorageType::Columnar => Arc::clone(&self.columnar) as Arc<dyn StorageAdapter>,
        }
    }

    pub fn all(&self) -> Vec<(StorageType, Arc<dyn StorageAdapter>)> {
        vec![
            (StorageType::Kv, self.adapter(StorageType::Kv)),
            (StorageType::Document, self.adapter(StorageType::Document)),
            (StorageType::Columnar, self.adapter(StorageType::Columnar)),
        ]
    }
}

/// Retry policy for transient adapter failures: N attempts with doubling
/// backoff, then escalate to `DurabilityFailure`.
pub fn write_with_retry(
    adapter: &dyn StorageAdapter,
    ops: &[WriteOp],
    attempts: u32,
    base_backoff: Duration,
) -> Result<()> {
    let mut backoff = base_backoff;
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match adapter.batch_write(ops) {
            Ok(()) => return Ok(()),
            Err(DbError::StorageError(msg)) => {
                tracing::warn!(attempt, error = %msg, "transient storage failure, retrying");
                last_err = Some(msg);
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(other) => return Err(other),
        }
    }
    Err(DbError::DurabilityFailure(format!(
        "storage writes failed after {} attempts: {}",
        attempts,
        last_err.unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_parse() {
        assert_eq!(StorageType::parse("KV"), Some(StorageType::Kv));
        assert_eq!(StorageType::parse("doc"), Some(StorageType::Document));
        assert_eq!(StorageType::parse("columnar"), Some(StorageType::Columnar));
        assert_eq!(StorageType::parse("lsm"), None);
    }

    #[test]
    fn test_qual_op_null_never_matches() {
        assert!(!QualOp::Eq.matches(&Value::Null, &Value::Null));
        assert!(!QualOp::Lt.matches(&Value::Null, &Value::Integer(1)));
    }

    #[test]
    fn test_qual_op_ordering() {
        assert!(QualOp::Lt.matches(&Value::Integer(1), &Value::Integer(2)));
        assert!(QualOp::GtEq.matches(&Value::Integer(2), &Value::Integer(2)));
        assert!(!QualOp::Gt.matches(&Value::Integer(2), &Value::Integer(2)));
    }
}
