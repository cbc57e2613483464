//! # sift-engine: The Engine
//!
//! Executes [`sift_core::SearchRequestPlan`]s against a relational store that
//! keeps one JSON document column per row.
//!
//! - [`store`]: the executor and document-table seams, plus the SQLite backend
//! - [`mapping`]: declared field types for timestamp handling
//! - [`context`]: per-request state, temp-table arena, cancellation
//! - [`aggs`]: depth-first aggregation walk
//! - [`search`]: the request orchestrator and response shape

pub mod aggs;
pub mod context;
pub mod error;
pub mod mapping;
pub mod search;
pub mod store;

pub use context::{CancelFlag, ExecutionContext, IndexTable, QueryTable, TempTables};
pub use error::{ExecutionError, StoreError};
pub use mapping::{FieldMappingService, FieldType, InMemoryMappings};
pub use search::{run, Hit, Hits, SearchEngine, SearchOptions, SearchResponse, SearchResult};
pub use store::{DocumentStore, IndexOutcome, RelationalExecutor, SqliteStore};
