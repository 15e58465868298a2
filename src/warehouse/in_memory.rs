use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{align_columns, Manifest, Warehouse};
use crate::error::{EtlError, Result};
use crate::table::Table;

/// In-memory warehouse implementation for development/testing.
pub struct InMemoryWarehouse {
    namespaces: Arc<Mutex<HashMap<String, HashMap<String, Table>>>>,
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self {
            namespaces: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces.entry(namespace.to_string()).or_default();
        debug!("Ensured namespace '{}'", namespace);
        Ok(())
    }

    async fn read_table(&self, namespace: &str, name: &str) -> Result<Option<Table>> {
        let namespaces = self.namespaces.lock().unwrap();
        Ok(namespaces
            .get(namespace)
            .and_then(|tables| tables.get(name))
            .cloned())
    }

    async fn append_table(&self, namespace: &str, name: &str, table: &Table) -> Result<usize> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let tables = namespaces
            .get_mut(namespace)
            .ok_or_else(|| EtlError::Infrastructure(format!("namespace '{namespace}' not found")))?;

        match tables.get_mut(name) {
            Some(existing) => {
                let aligned = align_columns(existing.columns(), table).ok_or_else(|| {
                    EtlError::ShapeMismatch {
                        table: format!("{namespace}.{name}"),
                        detail: format!(
                            "append columns {:?} do not match existing {:?}",
                            table.columns(),
                            existing.columns()
                        ),
                    }
                })?;
                for row in aligned {
                    existing.push_row(row);
                }
            }
            None => {
                tables.insert(name.to_string(), table.clone());
            }
        }
        debug!("Appended {} rows into {}.{}", table.row_count(), namespace, name);
        Ok(table.row_count())
    }

    async fn replace_table(&self, namespace: &str, name: &str, table: &Table) -> Result<usize> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let tables = namespaces
            .get_mut(namespace)
            .ok_or_else(|| EtlError::Infrastructure(format!("namespace '{namespace}' not found")))?;
        tables.insert(name.to_string(), table.clone());
        debug!("Replaced {}.{} with {} rows", namespace, name, table.row_count());
        Ok(table.row_count())
    }

    async fn manifest(&self) -> Result<Manifest> {
        let namespaces = self.namespaces.lock().unwrap();
        let mut manifest = Manifest::default();
        for (ns, tables) in namespaces.iter() {
            for (name, table) in tables {
                manifest.insert(ns, name, table.row_count());
            }
        }
        Ok(manifest)
    }
}
