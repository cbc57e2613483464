//! SQLite backend: one connection behind a mutex, `sift_*` functions
//! registered at open, one `sift_idx_<index>` table per index.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use sift_core::sql::{quote_ident, SQLITE};
use sift_core::{SqlDialect, SqlValue};
use tracing::{debug, info};

use super::{
    functions, index_table_name, validate_index_name, DocumentStore, IndexOutcome,
    RelationalExecutor, Row, INDEX_TABLE_PREFIX,
};
use crate::error::StoreError;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!(path = %path.display(), "opened document store");
        Self::with_connection(conn, busy_timeout)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn with_connection(conn: Connection, busy_timeout: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        functions::register(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl RelationalExecutor for SqliteStore {
    fn dialect(&self) -> &'static dyn SqlDialect {
        &SQLITE
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        debug!(sql, params = params.len(), "query");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&SQLITE.finalize(sql))?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sqlite)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(from_sqlite(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError> {
        debug!(sql, params = params.len(), "execute");
        let conn = self.lock()?;
        let changed = conn.execute(
            &SQLITE.finalize(sql),
            params_from_iter(params.iter().map(to_sqlite)),
        )?;
        Ok(changed)
    }
}

impl DocumentStore for SqliteStore {
    fn table_for(&self, index: &str) -> Result<Option<String>, StoreError> {
        let table = index_table_name(index)?;
        let rows = self.query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::Text(table.clone())],
        )?;
        Ok((!rows.is_empty()).then_some(table))
    }

    fn list_indices(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND substr(name, 1, ?) = ? ORDER BY name",
            &[
                SqlValue::Integer(INDEX_TABLE_PREFIX.len() as i64),
                SqlValue::from(INDEX_TABLE_PREFIX),
            ],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(SqlValue::Text(name)) => {
                    name.strip_prefix(INDEX_TABLE_PREFIX).map(str::to_string)
                }
                _ => None,
            })
            .filter(|index| validate_index_name(index).is_ok())
            .collect())
    }

    fn create_index(&self, index: &str) -> Result<(), StoreError> {
        let table = index_table_name(index)?;
        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id TEXT NOT NULL, type TEXT NOT NULL, doc TEXT NOT NULL, \
                 PRIMARY KEY (type, id))",
                quote_ident(&table)
            ),
            &[],
        )?;
        Ok(())
    }

    fn index_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Value,
    ) -> Result<IndexOutcome, StoreError> {
        self.create_index(index)?;
        let table = quote_ident(&index_table_name(index)?);
        let key = [SqlValue::from(doc_type), SqlValue::from(id)];
        let existing = self.query(
            &format!("SELECT 1 FROM {table} WHERE type = ? AND id = ?"),
            &key,
        )?;
        self.execute(
            &format!("INSERT OR REPLACE INTO {table} (id, type, doc) VALUES (?, ?, ?)"),
            &[
                SqlValue::from(id),
                SqlValue::from(doc_type),
                SqlValue::Text(serde_json::to_string(doc)?),
            ],
        )?;
        Ok(if existing.is_empty() {
            IndexOutcome::Created
        } else {
            IndexOutcome::Updated
        })
    }
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        SqlValue::Integer(i) => SqliteValue::Integer(*i),
        SqlValue::Real(r) => SqliteValue::Real(*r),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.list_indices().unwrap().is_empty());
        assert_eq!(store.table_for("tweets").unwrap(), None);

        let outcome = store
            .index_document("tweets", "tweet", "1", &json!({ "user": "kimchy" }))
            .unwrap();
        assert_eq!(outcome, IndexOutcome::Created);
        let outcome = store
            .index_document("tweets", "tweet", "1", &json!({ "user": "bob" }))
            .unwrap();
        assert_eq!(outcome, IndexOutcome::Updated);

        assert_eq!(store.list_indices().unwrap(), vec!["tweets".to_string()]);
        assert_eq!(
            store.table_for("tweets").unwrap().as_deref(),
            Some("sift_idx_tweets")
        );
        let rows = store
            .query("SELECT doc ->> '$.user' FROM \"sift_idx_tweets\"", &[])
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::from("bob")]]);
    }

    #[test]
    fn test_params_bind_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query(
                "SELECT ? || '?' || ?",
                &[SqlValue::from("a"), SqlValue::from("b")],
            )
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::from("a?b")]]);
    }

    #[test]
    fn test_invalid_index_name_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.create_index("Bad Name").unwrap_err();
        assert!(matches!(err, StoreError::InvalidIndexName(_)));
    }
}
