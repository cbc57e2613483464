//! # Request Orchestrator
//!
//! `compile_and_run` is the whole search path: build the plan, resolve the
//! index tables, compile the WHERE clause once, walk the aggregations, fetch
//! the page of hits, and shape the response.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use sift_core::sql::quote_ident;
use sift_core::{query, sort, PlanOptions, SearchRequestPlan, SortClause, SqlFragment, SqlValue};
use tracing::{debug, info};

use crate::aggs;
use crate::context::{CancelFlag, ExecutionContext, IndexTable, QueryTable};
use crate::error::{ExecutionError, StoreError};
use crate::mapping::FieldMappingService;
use crate::store::{DocumentStore, RelationalExecutor, Row};

/// What one execution of a plan produced, before hits are fetched.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub hits_where_clause: SqlFragment,
    pub from: i64,
    pub size: i64,
    pub sort: Vec<SortClause>,
    pub aggregations: Map<String, Value>,
}

/// Compile the plan's WHERE clause once, run the aggregation walk over it,
/// and release every temporary table whether or not the walk succeeded.
pub fn run(
    plan: &SearchRequestPlan,
    ctx: &mut ExecutionContext<'_>,
) -> Result<SearchResult, ExecutionError> {
    let where_clause = query::compile(plan.predicate(), ctx.executor().dialect())?;
    debug!(sql = where_clause.sql(), "compiled where clause");

    let base = QueryTable::filtered(ctx.targets(), ctx.types(), &where_clause);
    let walk = ctx.with_query_table(base, |ctx| aggs::execute(plan.aggregations(), ctx));
    debug!(temp_tables = ctx.temp_tables().len(), "releasing temp tables");
    let released = ctx.release_temp_tables();

    let aggregations = walk?;
    released.map_err(ExecutionError::aggregation)?;

    Ok(SearchResult {
        hits_where_clause: where_clause,
        from: plan.from(),
        size: plan.size(),
        sort: plan.sort().to_vec(),
        aggregations,
    })
}

// =============================================================================
// Response shape
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub took: u64,
    pub timed_out: bool,
    pub hits: Hits,
    pub aggregations: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hits {
    pub total: u64,
    pub max_score: Option<f64>,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_type")]
    pub doc_type: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_score")]
    pub score: Option<f64>,
    #[serde(rename = "_source")]
    pub source: Value,
}

/// Per-call overrides; `from`/`size` win over the request body.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub from: Option<i64>,
    pub size: Option<i64>,
    pub cancel: CancelFlag,
}

// =============================================================================
// Engine
// =============================================================================

pub struct SearchEngine<B> {
    backend: Arc<B>,
    mappings: Arc<dyn FieldMappingService>,
    plan_options: PlanOptions,
}

impl<B> Clone for SearchEngine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            mappings: Arc::clone(&self.mappings),
            plan_options: self.plan_options,
        }
    }
}

impl<B: RelationalExecutor + DocumentStore> SearchEngine<B> {
    pub fn new(backend: Arc<B>, mappings: Arc<dyn FieldMappingService>) -> Self {
        Self {
            backend,
            mappings,
            plan_options: PlanOptions::default(),
        }
    }

    pub fn with_plan_options(mut self, options: PlanOptions) -> Self {
        self.plan_options = options;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn compile_and_run(
        &self,
        raw: &str,
        indices: &[String],
        types: &[String],
        from: Option<i64>,
        size: Option<i64>,
    ) -> Result<SearchResponse, ExecutionError> {
        self.compile_and_run_with(
            raw,
            indices,
            types,
            SearchOptions {
                from,
                size,
                cancel: CancelFlag::new(),
            },
        )
    }

    pub fn compile_and_run_with(
        &self,
        raw: &str,
        indices: &[String],
        types: &[String],
        options: SearchOptions,
    ) -> Result<SearchResponse, ExecutionError> {
        let started = Instant::now();
        let plan = SearchRequestPlan::build_with(raw, self.plan_options)?;
        let targets = self.resolve_targets(indices)?;

        let backend: &B = &self.backend;
        let mut ctx = ExecutionContext::new(
            targets,
            types.to_vec(),
            backend,
            self.mappings.as_ref(),
            &plan,
            options.cancel.clone(),
        );
        let result = run(&plan, &mut ctx)?;
        ctx.check_cancelled()?;

        let from = options.from.filter(|n| *n >= 0).unwrap_or(result.from);
        let size = options.size.filter(|n| *n >= 0).unwrap_or(result.size);
        let hits = self
            .fetch_hits(&ctx, &result, from, size)
            .map_err(ExecutionError::hit_fetch)?;

        let took = started.elapsed().as_millis() as u64;
        let fingerprint = plan.fingerprint();
        info!(
            took,
            total = hits.total,
            indices = ctx.indices().len(),
            plan = &fingerprint[..12],
            "search complete"
        );
        Ok(SearchResponse {
            took,
            timed_out: false,
            hits,
            aggregations: result.aggregations,
        })
    }

    /// Human-readable SQL for the hit query of `raw` against `index`.
    pub fn explain(&self, raw: &str, index: &str) -> Result<String, ExecutionError> {
        let plan = SearchRequestPlan::build_with(raw, self.plan_options)?;
        let target = self.resolve_targets(&[index.to_string()])?;
        let dialect = self.backend.dialect();
        let where_clause = query::compile(plan.predicate(), dialect)?;

        let mut statement = SqlFragment::raw(format!(
            "SELECT id, type, doc FROM {}",
            target
                .first()
                .map(|t| quote_ident(&t.table))
                .unwrap_or_default()
        ));
        if !where_clause.is_empty() {
            statement.push_str(" WHERE ");
            statement.append(where_clause);
        }
        let order_by = sort::compile(plan.sort(), dialect);
        if !order_by.is_empty() {
            statement.push_str(" ");
            statement.push_str(&order_by);
        }
        Ok(statement.to_inline_sql())
    }

    /// Empty, `_all`, or `*` means every index; anything else must exist.
    fn resolve_targets(&self, indices: &[String]) -> Result<Vec<IndexTable>, ExecutionError> {
        let names = if indices.is_empty() || indices.iter().any(|i| i == "_all" || i == "*") {
            self.backend.list_indices()?
        } else {
            indices.to_vec()
        };

        let mut targets = Vec::with_capacity(names.len());
        for index in names {
            let table = match self.backend.table_for(&index) {
                Ok(Some(table)) => table,
                Ok(None) | Err(StoreError::InvalidIndexName(_)) => {
                    return Err(ExecutionError::NoSuchIndex { index })
                }
                Err(e) => return Err(e.into()),
            };
            if !targets.iter().any(|t: &IndexTable| t.index == index) {
                targets.push(IndexTable { index, table });
            }
        }
        Ok(targets)
    }

    fn fetch_hits(
        &self,
        ctx: &ExecutionContext<'_>,
        result: &SearchResult,
        from: i64,
        size: i64,
    ) -> Result<Hits, StoreError> {
        let executor = ctx.executor();
        let qt = QueryTable::filtered(ctx.targets(), ctx.types(), &result.hits_where_clause);

        let total = executor
            .query(&format!("SELECT COUNT(*) FROM {}", qt.sql()), qt.params())?
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        if size == 0 || ctx.targets().is_empty() {
            return Ok(Hits {
                total: total.max(0) as u64,
                max_score: None,
                hits: Vec::new(),
            });
        }

        let mut sql = format!("SELECT sift_index, id, type, doc FROM {}", qt.sql());
        let order_by = sort::compile(&result.sort, executor.dialect());
        if !order_by.is_empty() {
            sql.push(' ');
            sql.push_str(&order_by);
        }
        sql.push_str(&format!(" LIMIT {size} OFFSET {from}"));

        let hits = executor
            .query(&sql, qt.params())?
            .into_iter()
            .map(hit_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Hits {
            total: total.max(0) as u64,
            max_score: None,
            hits,
        })
    }
}

fn hit_from_row(row: Row) -> Result<Hit, StoreError> {
    let mut cols = row.into_iter().map(|v| match v {
        SqlValue::Text(s) => s,
        other => other.to_json().to_string(),
    });
    let index = cols.next().unwrap_or_default();
    let id = cols.next().unwrap_or_default();
    let doc_type = cols.next().unwrap_or_default();
    let source = match cols.next() {
        Some(doc) => serde_json::from_str(&doc)?,
        None => Value::Null,
    };
    Ok(Hit {
        index,
        doc_type,
        id,
        score: None,
        source,
    })
}
