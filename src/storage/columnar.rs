// Columnar reference adapter.
//
// Column-major storage with tombstoned deletes; a key map points rows back
// into the column vectors so keyed upserts stay idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::catalog::Catalog;
use crate::common::{Row, RowId, Value};
use crate::error::Result;
use crate::storage::{ScanQual, StorageAdapter, StorageType, WriteKind, WriteOp};

struct ColumnStore {
    /// One vector per schema column, all the same length.
    columns: Vec<Vec<Value>>,
    live: Vec<bool>,
    keys: Vec<String>,
    row_ids: Vec<RowId>,
    versions: Vec<u64>,
    key_map: HashMap<String, usize>,
}

impl ColumnStore {
    fn new(width: usize) -> Self {
        Self {
            columns: vec![Vec::new(); width],
            live: Vec::new(),
            keys: Vec::new(),
            row_ids: Vec::new(),
            versions: Vec::new(),
            key_map: HashMap::new(),
        }
    }

    fn upsert(&mut self, key: &str, values: &[Value], row_id: RowId, version: u64) {
        // Grow the column set if a write is wider than anything seen before.
        while self.columns.len() < values.len() {
            self.columns.push(vec![Value::Null; self.keys.len()]);
        }
        match self.key_map.get(key) {
            Some(&idx) => {
                for (c, column) in self.columns.iter_mut().enumerate() {
                    column[idx] = values.get(c).cloned().unwrap_or(Value::Null);
                }
                self.live[idx] = true;
                self.versions[idx] = version;
            }
            None => {
                let idx = self.keys.len();
                for (c, column) in self.columns.iter_mut().enumerate() {
                    column.push(values.get(c).cloned().unwrap_or(Value::Null));
                }
                self.live.push(true);
                self.keys.push(key.to_string());
                self.row_ids.push(row_id);
                self.versions.push(version);
                self.key_map.insert(key.to_string(), idx);
            }
        }
    }

    fn delete(&mut self, key: &str) {
        if let Some(&idx) = self.key_map.get(key) {
            self.live[idx] = false;
        }
    }

    fn row_at(&self, idx: usize, table: &str) -> Row {
        Row {
            values: self.columns.iter().map(|c| c[idx].clone()).collect(),
            row_id: self.row_ids[idx],
            key: self.keys[idx].clone(),
            source_table: table.to_string(),
            version: self.versions[idx],
        }
    }
}

pub struct ColumnarAdapter {
    tables: DashMap<String, RwLock<ColumnStore>>,
    catalog: Arc<Catalog>,
    next_row_id: AtomicU64,
}

impl ColumnarAdapter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            tables: DashMap::new(),
            catalog,
            next_row_id: AtomicU64::new(1),
        }
    }

    fn column_index(&self, table: &str, column: &str) -> Option<usize> {
        self.catalog
            .get_table(table)
            .and_then(|schema| schema.column_index(column))
    }
}

impl StorageAdapter for ColumnarAdapter {
    fn storage_type(&self) -> StorageType {
        StorageType::Columnar
    }

    fn scan(&self, table: &str, quals: &[ScanQual]) -> Result<Vec<Row>> {
        let Some(entry) = self.tables.get(&table.to_lowercase()) else {
            return Ok(Vec::new());
        };
        let store = entry.read();

        // Evaluate quals column-at-a-time before materialising rows.
        let mut selected: Vec<usize> = (0..store.keys.len())
            .filter(|&idx| store.live[idx])
            .collect();
        for qual in quals {
            let Some(col) = self.column_index(table, &qual.column) else {
                continue;
            };
            if col >= store.columns.len() {
                continue;
            }
            let column = &store.columns[col];
            selected.retain(|&idx| qual.op.matches(&column[idx], &qual.value));
        }

        let mut rows: Vec<Row> = selected
            .into_iter()
            .map(|idx| store.row_at(idx, table))
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    fn point_get(&self, table: &str, key: &str) -> Result<Option<Row>> {
        let Some(entry) = self.tables.get(&table.to_lowercase()) else {
            return Ok(None);
        };
        let store = entry.read();
        Ok(store
            .key_map
            .get(key)
            .copied()
            .filter(|&idx| store.live[idx])
            .map(|idx| store.row_at(idx, table)))
    }

    fn batch_write(&self, ops: &[WriteOp]) -> Result<()> {
        for op in ops {
            let width = self
                .catalog
                .get_table(&op.table)
                .map(|s| s.columns.len())
                .unwrap_or_else(|| op.values.as_ref().map(|v| v.len()).unwrap_or(0));
            let entry = self
                .tables
                .entry(op.table.to_lowercase())
                .or_insert_with(|| RwLock::new(ColumnStore::new(width)));
            let mut store = entry.write();
            match op.kind {
                WriteKind::Insert | WriteKind::Update => {
                    let row_id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
                    store.upsert(
                        &op.key,
                        op.values.as_deref().unwrap_or(&[]),
                        row_id,
                        op.version,
                    );
                }
                WriteKind::Delete => store.delete(&op.key),
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
    use crate::catalog::{Column, DataType, TableSchema};
    use crate::storage::QualOp;

    fn adapter() -> ColumnarAdapter {
        let catalog = Arc::new(Catalog::new());
        catalog
            .create_table(TableSchema::new(
                "metrics",
                vec![
                    Column::new("id", DataType::Integer),
                    Column::new("val", DataType::Float),
                ],
                StorageType::Columnar,
            ))
            .unwrap();
        ColumnarAdapter::new(catalog)
    }

    #[test]
    fn test_columnar_scan() {
        let adapter = adapter();
        for i in 0..4 {
            adapter
                .batch_write(&[WriteOp::insert(
                    "metrics",
                    i.to_string(),
                    vec![Value::Integer(i), Value::Float(i as f64 * 1.5)],
                )])
                .unwrap();
        }
        let rows = adapter.scan("metrics", &[]).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].values[1], Value::Float(3.0));
    }

    #[test]
    fn test_columnar_qual_pushdown() {
        let adapter = adapter();
        for i in 0..10 {
            adapter
                .batch_write(&[WriteOp::insert(
                    "metrics",
                    i.to_string(),
                    vec![Value::Integer(i), Value::Float(i as f64)],
                )])
                .unwrap();
        }
        let rows = adapter
            .scan(
                "metrics",
                &[ScanQual {
                    column: "id".into(),
                    op: QualOp::Gt,
                    value: Value::Integer(6),
                }],
            )
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_tombstone_delete_and_reinsert() {
        let adapter = adapter();
        adapter
            .batch_write(&[WriteOp::insert(
                "metrics",
                "1",
                vec![Value::Integer(1), Value::Float(1.0)],
            )])
            .unwrap();
        adapter
            .batch_write(&[WriteOp::delete(
                "metrics",
                "1",
                vec![Value::Integer(1), Value::Float(1.0)],
            )])
            .unwrap();
        assert!(adapter.scan("metrics", &[]).unwrap().is_empty());
        assert!(adapter.point_get("metrics", "1").unwrap().is_none());

        adapter
            .batch_write(&[WriteOp::insert(
                "metrics",
                "1",
                vec![Value::Integer(1), Value::Float(2.0)],
            )])
            .unwrap();
        let row = adapter.point_get("metrics", "1").unwrap().unwrap();
        assert_eq!(row.values[1], Value::Float(2.0));
    }
}
