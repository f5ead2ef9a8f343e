// Key-value reference adapter.
//
// Ordered map per table so parallel scans can partition the key range.
// Rows are stored as schema-ordered value vectors keyed by the row key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::common::{Row, RowId, Value};
use crate::error::Result;
use crate::storage::{ScanQual, StorageAdapter, StorageType, WriteKind, WriteOp};

#[derive(Debug, Clone)]
struct StoredRow {
    row_id: RowId,
    version: u64,
    values: Vec<Value>,
}

pub struct KvAdapter {
    tables: DashMap<String, RwLock<BTreeMap<String, StoredRow>>>,
    next_row_id: AtomicU64,
    /// Per-table schema column names captured from the first write; used to
    /// resolve qual columns without a catalog round trip.
    columns: DashMap<String, Vec<String>>,
}

impl KvAdapter {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_row_id: AtomicU64::new(1),
            columns: DashMap::new(),
        }
    }

    pub fn register_columns(&self, table: &str, columns: Vec<String>) {
        self.columns.insert(table.to_lowercase(), columns);
    }

    fn qual_matches(&self, table: &str, values: &[Value], quals: &[ScanQual]) -> bool {
        if quals.is_empty() {
            return true;
        }
        let Some(cols) = self.columns.get(&table.to_lowercase()) else {
            return true;
        };
        quals.iter().all(|q| {
            match cols.iter().position(|c| c.eq_ignore_ascii_case(&q.column)) {
                Some(idx) => values
                    .get(idx)
                    .map(|v| q.op.matches(v, &q.value))
                    .unwrap_or(false),
                None => true,
            }
        })
    }
}

impl Default for KvAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for KvAdapter {
    fn storage_type(&self) -> StorageType {
        StorageType::Kv
    }

    fn scan(&self, table: &str, quals: &[ScanQual]) -> Result<Vec<Row>> {
        let Some(entry) = self.tables.get(&table.to_lowercase()) else {
            return Ok(Vec::new());
        };
        let map = entry.read();
        Ok(map
            .iter()
            .filter(|(_, stored)| self.qual_matches(table, &stored.values, quals))
            .map(|(key, stored)| Row {
                values: stored.values.clone(),
                row_id: stored.row_id,
                key: key.clone(),
                source_table: table.to_string(),
                version: stored.version,
            })
            .collect())
    }

    fn point_get(&self, table: &str, key: &str) -> Result<Option<Row>> {
        let Some(entry) = self.tables.get(&table.to_lowercase()) else {
            return Ok(None);
        };
        let map = entry.read();
        Ok(map.get(key).map(|stored| Row {
            values: stored.values.clone(),
            row_id: stored.row_id,
            key: key.to_string(),
            source_table: table.to_string(),
            version: stored.version,
        }))
    }

    fn batch_write(&self, ops: &[WriteOp]) -> Result<()> {
        for op in ops {
            let entry = self
                .tables
                .entry(op.table.to_lowercase())
                .or_insert_with(|| RwLock::new(BTreeMap::new()));
            let mut map = entry.write();
            match op.kind {
                WriteKind::Insert | WriteKind::Update => {
                    let values = op.values.clone().unwrap_or_default();
                    // Upsert keeps re-delivery during recovery idempotent.
                    match map.get_mut(&op.key) {
                        Some(existing) => {
                            existing.values = values;
                            existing.version = op.version;
                        }
                        None => {
                            map.insert(
                                op.key.clone(),
                                StoredRow {
                                    row_id: self.next_row_id.fetch_add(1, Ordering::SeqCst),
                                    version: op.version,
                                    values,
                                },
                            );
                        }
                    }
                }
                WriteKind::Delete => {
                    map.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    fn next_row_key(&self, _table: &str) -> u64 {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::QualOp;

    fn row(values: Vec<Value>) -> Vec<Value> {
        values
    }

    #[test]
    fn test_insert_scan_roundtrip() {
        let kv = KvAdapter::new();
        kv.batch_write(&[WriteOp::insert(
            "t",
            "1",
            row(vec![Value::Integer(1), Value::Text("a".into())]),
        )])
        .unwrap();

        let rows = kv.scan("t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[1], Value::Text("a".into()));
        assert_eq!(rows[0].key, "1");
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let kv = KvAdapter::new();
        let op = WriteOp::insert("t", "1", row(vec![Value::Integer(1)]));
        kv.batch_write(std::slice::from_ref(&op)).unwrap();
        kv.batch_write(std::slice::from_ref(&op)).unwrap();
        assert_eq!(kv.scan("t", &[]).unwrap().len(), 1);

        let del = WriteOp::delete("t", "1", row(vec![Value::Integer(1)]));
        kv.batch_write(std::slice::from_ref(&del)).unwrap();
        kv.batch_write(std::slice::from_ref(&del)).unwrap();
        assert!(kv.scan("t", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_scan_applies_quals() {
        let kv = KvAdapter::new();
        kv.register_columns("t", vec!["k".into(), "v".into()]);
        for i in 0..10 {
            kv.batch_write(&[WriteOp::insert(
                "t",
                i.to_string(),
                row(vec![Value::Integer(i), Value::Text(format!("v{}", i))]),
            )])
            .unwrap();
        }

        let rows = kv
            .scan(
                "t",
                &[ScanQual {
                    column: "k".to_string(),
                    op: QualOp::Lt,
                    value: Value::Integer(3),
                }],
            )
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_point_get_missing_table() {
        let kv = KvAdapter::new();
        assert!(kv.point_get("nope", "1").unwrap().is_none());
    }
}
