//! # Execution Errors
//!
//! Failures that depend on the data or the store rather than on the request
//! text. Unlike [`SearchError`] these may succeed on a retry of the whole
//! request.

use sift_core::SearchError;
use thiserror::Error;

use crate::mapping::FieldType;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid index name [{0}]: must be lowercase alphanumerics, '_', '-', '.', or '+'")]
    InvalidIndexName(String),

    #[error("connection lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("no mapping found for field [{field}]")]
    NoSuchFieldMapping { field: String },

    #[error("field [{field}] of type [{field_type}] cannot be used in a date_histogram")]
    UnsupportedFieldType { field: String, field_type: FieldType },

    #[error("no such index [{index}]")]
    NoSuchIndex { index: String },

    #[error("aggregation execution failed: {cause}")]
    AggregationExecution {
        #[source]
        cause: StoreError,
    },

    #[error("failed to fetch hits: {cause}")]
    HitFetch {
        #[source]
        cause: StoreError,
    },

    #[error("search cancelled")]
    Cancelled,

    #[error("search timed out")]
    TimedOut,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutionError {
    pub(crate) fn aggregation(cause: StoreError) -> Self {
        Self::AggregationExecution { cause }
    }

    pub(crate) fn hit_fetch(cause: StoreError) -> Self {
        Self::HitFetch { cause }
    }

    /// Search-engine style error type name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Search(err) => err.kind(),
            Self::NoSuchFieldMapping { .. } | Self::UnsupportedFieldType { .. } => {
                "illegal_argument_exception"
            }
            Self::NoSuchIndex { .. } => "index_not_found_exception",
            Self::AggregationExecution { .. } => "aggregation_execution_exception",
            Self::HitFetch { .. } | Self::Store(_) => "search_phase_execution_exception",
            Self::Cancelled => "task_cancelled_exception",
            Self::TimedOut => "search_timeout_exception",
        }
    }

    /// True when the request itself is at fault and retrying cannot help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Search(_) | Self::NoSuchFieldMapping { .. } | Self::UnsupportedFieldType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_errors_stay_transparent() {
        let err: ExecutionError = SearchError::MalformedQuery("bad".into()).into();
        assert_eq!(err.to_string(), "malformed query: bad");
        assert_eq!(err.kind(), "parsing_exception");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_aggregation_failure_keeps_cause() {
        let err = ExecutionError::aggregation(StoreError::Poisoned);
        assert!(err.to_string().contains("poisoned"));
        assert!(!err.is_client_error());
    }
}
