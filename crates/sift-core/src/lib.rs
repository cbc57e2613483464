//! # sift-core: The Compiler
//!
//! Turns a search request body into a [`SearchRequestPlan`] and renders its
//! pieces as parameterized SQL. Nothing in this crate performs I/O; the
//! engine crate executes what is produced here.
//!
//! ```text
//! body ──► plan ──┬─► query::compile ──► WHERE fragment
//!                 ├─► sort::compile  ──► ORDER BY
//!                 └─► aggs tree      ──► executed by sift-engine
//! ```

pub mod aggs;
pub mod error;
pub mod plan;
pub mod query;
pub mod sort;
pub mod sql;

pub use aggs::{AggregationNode, DateFormat, Interval, MetricKind, NamedAggregation};
pub use error::{Result, SearchError};
pub use plan::{PlanOptions, SearchRequestPlan};
pub use query::Predicate;
pub use sort::SortClause;
pub use sql::{SqlDialect, SqlFragment, SqlValue, TimestampSource};
