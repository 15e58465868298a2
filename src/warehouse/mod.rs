use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::table::Table;

mod in_memory;
mod sqlite;

pub use in_memory::InMemoryWarehouse;
pub use sqlite::SqliteWarehouse;

pub const RAW: &str = "raw";
pub const STAGING: &str = "staging";
pub const ANALYTICS: &str = "analytics";

/// Snapshot of which logical tables exist and how many rows each holds.
/// Computed once per stage boundary and handed to the stage, replacing
/// repeated per-table existence probes against storage metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// "namespace.table" -> row count
    pub tables: BTreeMap<String, usize>,
}

impl Manifest {
    pub fn insert(&mut self, namespace: &str, name: &str, rows: usize) {
        self.tables.insert(format!("{namespace}.{name}"), rows);
    }

    pub fn exists(&self, namespace: &str, name: &str) -> bool {
        self.tables.contains_key(&format!("{namespace}.{name}"))
    }

    pub fn row_count(&self, namespace: &str, name: &str) -> usize {
        self.tables
            .get(&format!("{namespace}.{name}"))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_rows(&self, namespace: &str, name: &str) -> bool {
        self.row_count(namespace, name) > 0
    }
}

/// Persistent store every stage boundary passes through. Implementations
/// must make `replace_table` an atomic swap: the previous snapshot stays
/// readable until the new one lands.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Idempotently create a namespace.
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    /// Read a full table; Ok(None) when it does not exist.
    async fn read_table(&self, namespace: &str, name: &str) -> Result<Option<Table>>;

    /// Append rows, creating the table on first write. Returns rows written.
    async fn append_table(&self, namespace: &str, name: &str, table: &Table) -> Result<usize>;

    /// Replace the table wholesale via an atomic swap. Returns rows written.
    async fn replace_table(&self, namespace: &str, name: &str, table: &Table) -> Result<usize>;

    async fn manifest(&self) -> Result<Manifest>;
}

/// Reorder an incoming table's rows to an existing column layout. Append
/// requires an identical column set; order differences are tolerated.
pub(crate) fn align_columns(existing: &[String], incoming: &Table) -> Option<Vec<Vec<crate::table::Value>>> {
    if existing.len() != incoming.column_count() {
        return None;
    }
    let mapping: Option<Vec<usize>> = existing
        .iter()
        .map(|c| incoming.column_index(c))
        .collect();
    let mapping = mapping?;
    Some(
        incoming
            .rows()
            .iter()
            .map(|row| mapping.iter().map(|&i| row[i].clone()).collect())
            .collect(),
    )
}
