//! # Execution Context
//!
//! Per-request state for one aggregation walk: which index tables are in
//! scope, the collaborators, the query table the current node reads from,
//! and the arena of temporary tables created along the way.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sift_core::sql::{quote_ident, quote_literal};
use sift_core::{SearchRequestPlan, SqlFragment, SqlValue};
use tracing::{debug, warn};

use crate::error::{ExecutionError, StoreError};
use crate::mapping::FieldMappingService;
use crate::store::RelationalExecutor;

/// Prefix of every temporary table the engine creates.
pub const TEMP_TABLE_PREFIX: &str = "sift_tmp_";

/// Shared cancellation switch. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An index and the table that stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTable {
    pub index: String,
    pub table: String,
}

/// Something that can follow `FROM`: a table name or a parenthesized,
/// aliased subquery together with the parameters it binds.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTable {
    sql: String,
    params: Vec<SqlValue>,
}

impl QueryTable {
    pub fn table(name: &str) -> Self {
        Self {
            sql: quote_ident(name),
            params: Vec::new(),
        }
    }

    /// The documents of `targets` restricted to `types` (when non-empty) and
    /// to `filter` (when non-empty). Columns: `sift_index, id, type, doc`.
    pub fn filtered(targets: &[IndexTable], types: &[String], filter: &SqlFragment) -> Self {
        if targets.is_empty() {
            return Self {
                sql: "(SELECT NULL AS sift_index, NULL AS id, NULL AS type, NULL AS doc \
                      WHERE 1 = 0) AS q"
                    .into(),
                params: Vec::new(),
            };
        }

        let union = targets
            .iter()
            .map(|t| {
                format!(
                    "SELECT {} AS sift_index, id, type, doc FROM {}",
                    quote_literal(&t.index),
                    quote_ident(&t.table)
                )
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ");

        let mut conditions = Vec::with_capacity(2);
        if !types.is_empty() {
            conditions.push(SqlFragment::bound(
                format!("type IN ({})", vec!["?"; types.len()].join(", ")),
                types.iter().map(|t| SqlValue::from(t.as_str())).collect(),
            ));
        }
        conditions.push(filter.clone());
        let condition = SqlFragment::join(conditions, " AND ");

        let mut sql = format!("(SELECT sift_index, id, type, doc FROM ({union}) AS src");
        if !condition.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(condition.sql());
        }
        sql.push_str(") AS q");
        Self {
            sql,
            params: condition.params().to_vec(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

// =============================================================================
// Temporary table arena
// =============================================================================

/// Temporary tables created during one execution. Every name is registered
/// before its table is created, so a failure halfway through a `CREATE`
/// still gets a `DROP` on release.
pub struct TempTables<'e> {
    executor: &'e dyn RelationalExecutor,
    names: Vec<String>,
    registered: HashSet<String>,
}

impl<'e> TempTables<'e> {
    pub fn new(executor: &'e dyn RelationalExecutor) -> Self {
        Self {
            executor,
            names: Vec::new(),
            registered: HashSet::new(),
        }
    }

    /// Returns false if `name` was already registered.
    pub fn register(&mut self, name: &str) -> bool {
        if !self.registered.insert(name.to_string()) {
            return false;
        }
        self.names.push(name.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Drop every registered table, newest first. Keeps going past failures
    /// and reports the first one.
    pub fn release(&mut self) -> Result<(), StoreError> {
        let mut first_err = None;
        while let Some(name) = self.names.pop() {
            self.registered.remove(&name);
            let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&name));
            match self.executor.execute(&sql, &[]) {
                Ok(_) => debug!(table = %name, "dropped temp table"),
                Err(e) => {
                    warn!(table = %name, error = %e, "failed to drop temp table");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TempTables<'_> {
    fn drop(&mut self) {
        if self.names.is_empty() {
            return;
        }
        warn!(count = self.names.len(), "temp tables outlived their execution");
        let _ = self.release();
    }
}

/// `sift_tmp_` plus a hex SHA-256 prefix of `parts`.
pub fn temp_table_name(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{TEMP_TABLE_PREFIX}{}", &digest[..32])
}

// =============================================================================
// Context
// =============================================================================

pub struct ExecutionContext<'e> {
    targets: Vec<IndexTable>,
    indices: Vec<String>,
    types: Vec<String>,
    executor: &'e dyn RelationalExecutor,
    mappings: &'e dyn FieldMappingService,
    temp_tables: TempTables<'e>,
    query_table: QueryTable,
    plan: &'e SearchRequestPlan,
    cancel: CancelFlag,
}

impl<'e> ExecutionContext<'e> {
    pub fn new(
        targets: Vec<IndexTable>,
        types: Vec<String>,
        executor: &'e dyn RelationalExecutor,
        mappings: &'e dyn FieldMappingService,
        plan: &'e SearchRequestPlan,
        cancel: CancelFlag,
    ) -> Self {
        let indices = targets.iter().map(|t| t.index.clone()).collect();
        let query_table = QueryTable::filtered(&targets, &types, &SqlFragment::empty());
        Self {
            targets,
            indices,
            types,
            executor,
            mappings,
            temp_tables: TempTables::new(executor),
            query_table,
            plan,
            cancel,
        }
    }

    pub fn targets(&self) -> &[IndexTable] {
        &self.targets
    }

    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn executor(&self) -> &'e dyn RelationalExecutor {
        self.executor
    }

    pub fn mappings(&self) -> &'e dyn FieldMappingService {
        self.mappings
    }

    pub fn plan(&self) -> &'e SearchRequestPlan {
        self.plan
    }

    pub fn query_table(&self) -> &QueryTable {
        &self.query_table
    }

    pub fn temp_tables(&self) -> &TempTables<'e> {
        &self.temp_tables
    }

    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `f` with `table` in scope, restoring the previous table afterwards.
    pub fn with_query_table<R>(&mut self, table: QueryTable, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.query_table, table);
        let result = f(self);
        self.query_table = previous;
        result
    }

    /// Create temp table `name` from `select` unless this context already
    /// made it. The name is registered first and any stale table of the same
    /// name is dropped before the `CREATE`.
    pub fn materialize(
        &mut self,
        name: &str,
        select: &str,
        params: &[SqlValue],
    ) -> Result<(), StoreError> {
        if !self.temp_tables.register(name) {
            debug!(table = %name, "reusing temp table");
            return Ok(());
        }
        let ident = quote_ident(name);
        self.executor
            .execute(&format!("DROP TABLE IF EXISTS {ident}"), &[])?;
        self.executor
            .execute(&format!("CREATE TEMP TABLE {ident} AS {select}"), params)?;
        debug!(table = %name, "created temp table");
        Ok(())
    }

    pub fn release_temp_tables(&mut self) -> Result<(), StoreError> {
        self.temp_tables.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn targets() -> Vec<IndexTable> {
        vec![
            IndexTable { index: "a".into(), table: "sift_idx_a".into() },
            IndexTable { index: "b".into(), table: "sift_idx_b".into() },
        ]
    }

    #[test]
    fn test_filtered_query_table_orders_params() {
        let filter = SqlFragment::bound("doc ->> '$.x' = ?", vec![SqlValue::from("v")]);
        let qt = QueryTable::filtered(&targets(), &["t".to_string()], &filter);
        assert_eq!(
            qt.sql(),
            "(SELECT sift_index, id, type, doc FROM (\
             SELECT 'a' AS sift_index, id, type, doc FROM \"sift_idx_a\" UNION ALL \
             SELECT 'b' AS sift_index, id, type, doc FROM \"sift_idx_b\") AS src \
             WHERE type IN (?) AND doc ->> '$.x' = ?) AS q"
        );
        assert_eq!(qt.params(), &[SqlValue::from("t"), SqlValue::from("v")]);
    }

    #[test]
    fn test_unfiltered_query_table_has_no_where() {
        let qt = QueryTable::filtered(&targets()[..1], &[], &SqlFragment::empty());
        assert!(!qt.sql().contains("WHERE"));
        assert!(qt.params().is_empty());
    }

    #[test]
    fn test_temp_table_names_are_content_derived() {
        let a = temp_table_name(&["plan", "day"]);
        assert_eq!(a, temp_table_name(&["plan", "day"]));
        assert_ne!(a, temp_table_name(&["plan", "month"]));
        assert_ne!(temp_table_name(&["ab", "c"]), temp_table_name(&["a", "bc"]));
        assert!(a.starts_with(TEMP_TABLE_PREFIX));
        assert_eq!(a.len(), TEMP_TABLE_PREFIX.len() + 32);
    }

    #[test]
    fn test_release_drops_in_reverse_and_clears() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut arena = TempTables::new(&store);
        for name in ["sift_tmp_one", "sift_tmp_two"] {
            assert!(arena.register(name));
            store
                .execute(&format!("CREATE TEMP TABLE {name} (x)"), &[])
                .unwrap();
        }
        assert!(!arena.register("sift_tmp_one"));
        assert_eq!(arena.len(), 2);
        arena.release().unwrap();
        assert!(arena.is_empty());
        let left = store
            .query("SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table'", &[])
            .unwrap();
        assert_eq!(left, vec![vec![SqlValue::Integer(0)]]);
    }

    #[test]
    fn test_drop_releases_leftovers() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let mut arena = TempTables::new(&store);
            arena.register("sift_tmp_left");
            store
                .execute("CREATE TEMP TABLE sift_tmp_left (x)", &[])
                .unwrap();
        }
        let left = store
            .query("SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table'", &[])
            .unwrap();
        assert_eq!(left, vec![vec![SqlValue::Integer(0)]]);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
