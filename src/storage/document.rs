// Document reference adapter.
//
// Rows live as JSON objects keyed by row key; the catalog schema maps them
// back onto the unified column order at scan time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::catalog::{Catalog, DataType, TableSchema};
use crate::common::{Row, RowId, Value};
use crate::error::Result;
use crate::storage::{ScanQual, StorageAdapter, StorageType, WriteKind, WriteOp};

#[derive(Debug, Clone)]
struct StoredDoc {
    row_id: RowId,
    version: u64,
    doc: serde_json::Value,
}

pub struct DocumentAdapter {
    tables: DashMap<String, RwLock<HashMap<String, StoredDoc>>>,
    catalog: Arc<Catalog>,
    next_row_id: AtomicU64,
}

impl DocumentAdapter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            tables: DashMap::new(),
            catalog,
            next_row_id: AtomicU64::new(1),
        }
    }

    fn to_document(schema: Option<&TableSchema>, values: &[Value]) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        match schema {
            Some(schema) => {
                for (column, value) in schema.columns.iter().zip(values.iter()) {
                    obj.insert(column.name.clone(), value.to_json());
                }
            }
            None => {
                for (i, value) in values.iter().enumerate() {
                    obj.insert(format!("c{}", i), value.to_json());
                }
            }
        }
        serde_json::Value::Object(obj)
    }

    fn from_document(schema: Option<&TableSchema>, doc: &serde_json::Value) -> Vec<Value> {
        let Some(obj) = doc.as_object() else {
            return Vec::new();
        };
        match schema {
            Some(schema) => schema
                .columns
                .iter()
                .map(|column| {
                    obj.get(&column.name)
                        .map(|v| typed_value(column.data_type, v))
                        .unwrap_or(Value::Null)
                })
                .collect(),
            None => obj.values().map(Value::from_json).collect(),
        }
    }

    fn rows_matching(
        &self,
        table: &str,
        quals: &[ScanQual],
        docs: &HashMap<String, StoredDoc>,
    ) -> Vec<Row> {
        let schema = self.catalog.get_table(table);
        let mut rows: Vec<Row> = docs
            .iter()
            .map(|(key, stored)| Row {
                values: Self::from_document(schema.as_ref(), &stored.doc),
                row_id: stored.row_id,
                key: key.clone(),
                source_table: table.to_string(),
                version: stored.version,
            })
            .filter(|row| match &schema {
                Some(schema) => quals.iter().all(|q| {
                    schema
                        .column_index(&q.column)
                        .and_then(|idx| row.values.get(idx))
                        .map(|v| q.op.matches(v, &q.value))
                        .unwrap_or(true)
                }),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}

fn typed_value(data_type: DataType, json: &serde_json::Value) -> Value {
    if json.is_null() {
        return Value::Null;
    }
    match data_type {
        DataType::Timestamp => json
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
            .unwrap_or(Value::Null),
        _ => Value::from_json(json),
    }
}

impl StorageAdapter for DocumentAdapter {
    fn storage_type(&self) -> StorageType {
        StorageType::Document
    }

    fn scan(&self, table: &str, quals: &[ScanQual]) -> Result<Vec<Row>> {
        let Some(entry) = self.tables.get(&table.to_lowercase()) else {
            return Ok(Vec::new());
        };
        let docs = entry.read();
        Ok(self.rows_matching(table, quals, &docs))
    }

    fn point_get(&self, table: &str, key: &str) -> Result<Option<Row>> {
        let Some(entry) = self.tables.get(&table.to_lowercase()) else {
            return Ok(None);
        };
        let docs = entry.read();
        let schema = self.catalog.get_table(table);
        Ok(docs.get(key).map(|stored| Row {
            values: Self::from_document(schema.as_ref(), &stored.doc),
            row_id: stored.row_id,
            key: key.to_string(),
            source_table: table.to_string(),
            version: stored.version,
        }))
    }

    fn batch_write(&self, ops: &[WriteOp]) -> Result<()> {
        for op in ops {
            let schema = self.catalog.get_table(&op.table);
            let entry = self
                .tables
                .entry(op.table.to_lowercase())
                .or_insert_with(|| RwLock::new(HashMap::new()));
            let mut docs = entry.write();
            match op.kind {
                WriteKind::Insert | WriteKind::Update => {
                    let doc =
                        Self::to_document(schema.as_ref(), op.values.as_deref().unwrap_or(&[]));
                    match docs.get_mut(&op.key) {
                        Some(existing) => {
                            existing.doc = doc;
                            existing.version = op.version;
                        }
                        None => {
                            docs.insert(
                                op.key.clone(),
                                StoredDoc {
                                    row_id: self.next_row_id.fetch_add(1, Ordering::SeqCst),
                                    version: op.version,
                                    doc,
                                },
                            );
                        }
                    }
                }
                WriteKind::Delete => {
                    docs.remove(&op.key);
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
    use crate::catalog::Column;
    use crate::storage::QualOp;

    fn catalog_with_docs() -> Arc<Catalog> {
        let catalog = Arc::new(Catalog::new());
        catalog
            .create_table(TableSchema::new(
                "docs",
                vec![
                    Column::new("id", DataType::Integer),
                    Column::new("body", DataType::Text),
                ],
                StorageType::Document,
            ))
            .unwrap();
        catalog
    }

    #[test]
    fn test_document_roundtrip() {
        let adapter = DocumentAdapter::new(catalog_with_docs());
        adapter
            .batch_write(&[WriteOp::insert(
                "docs",
                "1",
                vec![Value::Integer(1), Value::Text("hello".into())],
            )])
            .unwrap();

        let row = adapter.point_get("docs", "1").unwrap().unwrap();
        assert_eq!(row.values, vec![Value::Integer(1), Value::Text("hello".into())]);
    }

    #[test]
    fn test_document_qual_filter() {
        let adapter = DocumentAdapter::new(catalog_with_docs());
        for i in 0..5 {
            adapter
                .batch_write(&[WriteOp::insert(
                    "docs",
                    i.to_string(),
                    vec![Value::Integer(i), Value::Text(format!("d{}", i))],
                )])
                .unwrap();
        }
        let rows = adapter
            .scan(
                "docs",
                &[ScanQual {
                    column: "id".to_string(),
                    op: QualOp::GtEq,
                    value: Value::Integer(3),
                }],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_delete_idempotent() {
        let adapter = DocumentAdapter::new(catalog_with_docs());
        adapter
            .batch_write(&[WriteOp::insert("docs", "1", vec![Value::Integer(1), Value::Null])])
            .unwrap();
        let del = WriteOp::delete("docs", "1", vec![Value::Integer(1), Value::Null]);
        adapter.batch_write(std::slice::from_ref(&del)).unwrap();
        adapter.batch_write(std::slice::from_ref(&del)).unwrap();
        assert!(adapter.scan("docs", &[]).unwrap().is_empty());
    }
}
