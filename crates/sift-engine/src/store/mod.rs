//! # Storage Seams
//!
//! Two roles the engine needs from a database: running parameterized SQL
//! ([`RelationalExecutor`]) and owning the per-index document tables
//! ([`DocumentStore`]). [`SqliteStore`] plays both.

mod functions;
mod sqlite;

pub use sqlite::SqliteStore;

use regex::Regex;
use serde_json::Value;
use sift_core::{SqlDialect, SqlValue};
use std::sync::OnceLock;

use crate::error::StoreError;

/// One result row, columns in select order.
pub type Row = Vec<SqlValue>;

/// Prefix of every document table; the rest of the name is the index name.
pub const INDEX_TABLE_PREFIX: &str = "sift_idx_";

pub trait RelationalExecutor: Send + Sync {
    fn dialect(&self) -> &'static dyn SqlDialect;

    /// Run a statement that returns rows. `sql` uses `?` placeholders.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;

    /// Run a statement for its effect; returns the number of rows changed.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError>;
}

/// Whether a stored document replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    Updated,
}

impl IndexOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

pub trait DocumentStore: Send + Sync {
    /// Table backing `index`, or `None` if the index does not exist.
    fn table_for(&self, index: &str) -> Result<Option<String>, StoreError>;

    fn list_indices(&self) -> Result<Vec<String>, StoreError>;

    fn create_index(&self, index: &str) -> Result<(), StoreError>;

    /// Store `doc` under `(doc_type, id)`, creating the index on first use.
    fn index_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Value,
    ) -> Result<IndexOutcome, StoreError>;
}

/// Index names become part of a table identifier, so they are restricted.
pub fn validate_index_name(index: &str) -> Result<(), StoreError> {
    static VALID: OnceLock<Regex> = OnceLock::new();
    let re = VALID
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_.+-]{0,199}$").expect("valid index-name regex"));
    if re.is_match(index) {
        Ok(())
    } else {
        Err(StoreError::InvalidIndexName(index.to_string()))
    }
}

pub fn index_table_name(index: &str) -> Result<String, StoreError> {
    validate_index_name(index)?;
    Ok(format!("{INDEX_TABLE_PREFIX}{index}"))
}
