// Table catalog.
//
// Schemas, index metadata, and the table→storage-engine routing used by the
// executor and the distributed coordinator. The catalog snapshot is persisted
// as JSON under the data directory so DDL survives restarts; row data itself
// is rebuilt by WAL recovery.

use std::fmt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::parser::ast::Expr;
use crate::storage::StorageType;

/// SQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
    Json,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
            DataType::Json => write!(f, "JSON"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<Expr>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDef>,
    pub checks: Vec<Expr>,
    pub foreign_keys: Vec<ForeignKey>,
    pub storage: StorageType,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>, storage: StorageType) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            indexes: Vec::new(),
            checks: Vec::new(),
            foreign_keys: Vec::new(),
            storage,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// In-memory catalog with a JSON snapshot for DDL durability.
pub struct Catalog {
    tables: DashMap<String, TableSchema>,
    snapshot_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
struct CatalogSnapshot {
    tables: Vec<TableSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            snapshot_path: None,
        }
    }

    /// Catalog persisted under `dir/catalog.json`, loading any existing
    /// snapshot.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join("catalog.json");
        let catalog = Self {
            tables: DashMap::new(),
            snapshot_path: Some(path.clone()),
        };
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let snapshot: CatalogSnapshot = serde_json::from_str(&raw)?;
            for table in snapshot.tables {
                catalog.tables.insert(table.name.to_lowercase(), table);
            }
        }
        Ok(catalog)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = CatalogSnapshot {
            tables: self.tables.iter().map(|e| e.value().clone()).collect(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let key = schema.name.to_lowercase();
        if self.tables.contains_key(&key) {
            return Err(DbError::AlreadyExists(format!(
                "table '{}' already exists",
                schema.name
            )));
        }
        self.tables.insert(key, schema);
        self.persist()
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        if self.tables.remove(&name.to_lowercase()).is_none() {
            return Err(DbError::NotFound(format!("table '{}' does not exist", name)));
        }
        self.persist()
    }

    pub fn get_table(&self, name: &str) -> Option<TableSchema> {
        self.tables.get(&name.to_lowercase()).map(|t| t.clone())
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|e| e.value().name.clone()).collect()
    }

    pub fn storage_type(&self, table: &str) -> Option<StorageType> {
        self.get_table(table).map(|t| t.storage)
    }

    pub fn create_index(&self, index: IndexDef) -> Result<()> {
        let key = index.table.to_lowercase();
        let mut entry = self
            .tables
            .get_mut(&key)
            .ok_or_else(|| DbError::NotFound(format!("table '{}' does not exist", index.table)))?;
        if entry.indexes.iter().any(|i| i.name == index.name) {
            return Err(DbError::AlreadyExists(format!(
                "index '{}' already exists",
                index.name
            )));
        }
        entry.indexes.push(index);
        drop(entry);
        self.persist()
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        for mut entry in self.tables.iter_mut() {
            if let Some(pos) = entry.indexes.iter().position(|i| i.name == name) {
                entry.indexes.remove(pos);
                drop(entry);
                return self.persist();
            }
        }
        Err(DbError::NotFound(format!("index '{}' does not exist", name)))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
