use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{align_columns, Manifest, Warehouse};
use crate::error::{EtlError, Result};
use crate::table::{Table, Value};

/// SQLite-backed warehouse. Logical namespaces live in a registry table and
/// map to `namespace__table` physical names; `replace_table` stages rows in
/// an incoming table and swaps it in inside a single transaction, so the old
/// snapshot stays queryable until the new one lands.
pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
}

impl SqliteWarehouse {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::setup(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS namespaces (
                name TEXT PRIMARY KEY
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn physical(namespace: &str, name: &str) -> String {
        format!("{namespace}__{name}")
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Int(i) => rusqlite::types::Value::Integer(*i),
        Value::Float(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

fn from_sql(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn table_exists(conn: &Connection, physical: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![physical],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_columns(conn: &Connection, physical: &str) -> Result<Vec<String>> {
    let stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 0", quote(physical)))?;
    Ok(stmt.column_names().iter().map(|s| s.to_string()).collect())
}

fn create_table(conn: &Connection, physical: &str, columns: &[String]) -> Result<()> {
    let cols = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    conn.execute_batch(&format!("CREATE TABLE {} ({cols})", quote(physical)))?;
    Ok(())
}

fn insert_rows(conn: &Connection, physical: &str, rows: &[Vec<Value>]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let placeholders = (1..=rows[0].len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("INSERT INTO {} VALUES ({placeholders})", quote(physical));
    let mut stmt = conn.prepare(&sql)?;
    for row in rows {
        stmt.execute(rusqlite::params_from_iter(row.iter().map(to_sql)))?;
    }
    Ok(())
}

fn namespace_exists(conn: &Connection, namespace: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM namespaces WHERE name = ?1",
        params![namespace],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO namespaces (name) VALUES (?1)",
            params![namespace],
        )?;
        debug!("Ensured namespace '{}'", namespace);
        Ok(())
    }

    async fn read_table(&self, namespace: &str, name: &str) -> Result<Option<Table>> {
        let conn = self.conn.lock().unwrap();
        let physical = Self::physical(namespace, name);
        if !table_exists(&conn, &physical)? {
            return Ok(None);
        }
        let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote(&physical)))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let width = columns.len();
        let mut table = Table::new(columns);
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i)?));
            }
            table.push_row(values);
        }
        Ok(Some(table))
    }

    async fn append_table(&self, namespace: &str, name: &str, table: &Table) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        if !namespace_exists(&conn, namespace)? {
            return Err(EtlError::Infrastructure(format!(
                "namespace '{namespace}' not found"
            )));
        }
        let physical = Self::physical(namespace, name);
        let rows: Vec<Vec<Value>> = if table_exists(&conn, &physical)? {
            let existing = table_columns(&conn, &physical)?;
            align_columns(&existing, table).ok_or_else(|| EtlError::ShapeMismatch {
                table: format!("{namespace}.{name}"),
                detail: format!(
                    "append columns {:?} do not match existing {:?}",
                    table.columns(),
                    existing
                ),
            })?
        } else {
            create_table(&conn, &physical, table.columns())?;
            table.rows().to_vec()
        };
        insert_rows(&conn, &physical, &rows)?;
        debug!("Appended {} rows into {}.{}", rows.len(), namespace, name);
        Ok(rows.len())
    }

    async fn replace_table(&self, namespace: &str, name: &str, table: &Table) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        if !namespace_exists(&conn, namespace)? {
            return Err(EtlError::Infrastructure(format!(
                "namespace '{namespace}' not found"
            )));
        }
        let physical = Self::physical(namespace, name);
        let incoming = format!("{physical}__incoming");

        let tx = conn.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&incoming)))?;
        create_table(&tx, &incoming, table.columns())?;
        insert_rows(&tx, &incoming, table.rows())?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; ALTER TABLE {} RENAME TO {};",
            quote(&physical),
            quote(&incoming),
            quote(&physical)
        ))?;
        tx.commit()?;

        debug!("Replaced {}.{} with {} rows", namespace, name, table.row_count());
        Ok(table.row_count())
    }

    async fn manifest(&self) -> Result<Manifest> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name != 'namespaces'",
        )?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut manifest = Manifest::default();
        for physical in names {
            if physical.ends_with("__incoming") {
                continue;
            }
            let Some((ns, name)) = physical.split_once("__") else {
                continue;
            };
            let rows: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote(&physical)),
                [],
                |row| row.get(0),
            )?;
            manifest.insert(ns, name, rows as usize);
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new(vec!["student_id", "score"]);
        t.push_row(vec![Value::Int(1), Value::Float(85.5)]);
        t.push_row(vec![Value::Int(2), Value::Null]);
        t
    }

    #[tokio::test]
    async fn roundtrip_preserves_cell_types() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        wh.ensure_namespace("raw").await.unwrap();
        wh.append_table("raw", "submissions", &sample()).await.unwrap();

        let back = wh.read_table("raw", "submissions").await.unwrap().unwrap();
        assert_eq!(back.columns(), &["student_id".to_string(), "score".to_string()]);
        assert_eq!(back.value(0, "score"), Some(&Value::Float(85.5)));
        assert_eq!(back.value(1, "score"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn replace_swaps_atomically_and_drops_incoming() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        wh.ensure_namespace("analytics").await.unwrap();
        wh.replace_table("analytics", "student_features", &sample()).await.unwrap();

        let mut next = Table::new(vec!["student_id", "score"]);
        next.push_row(vec![Value::Int(9), Value::Float(50.0)]);
        wh.replace_table("analytics", "student_features", &next).await.unwrap();

        let back = wh
            .read_table("analytics", "student_features")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.row_count(), 1);
        assert_eq!(back.value(0, "student_id"), Some(&Value::Int(9)));

        let manifest = wh.manifest().await.unwrap();
        assert_eq!(manifest.row_count("analytics", "student_features"), 1);
        assert_eq!(manifest.tables.len(), 1);
    }

    #[tokio::test]
    async fn missing_namespace_is_an_infrastructure_error() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        let err = wh.append_table("nope", "t", &sample()).await;
        assert!(matches!(err, Err(EtlError::Infrastructure(_))));
    }

    #[tokio::test]
    async fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.db");
        {
            let wh = SqliteWarehouse::open(&path).unwrap();
            wh.ensure_namespace("raw").await.unwrap();
            wh.append_table("raw", "t", &sample()).await.unwrap();
        }
        let wh = SqliteWarehouse::open(&path).unwrap();
        assert_eq!(wh.read_table("raw", "t").await.unwrap().unwrap().row_count(), 2);
    }
}
