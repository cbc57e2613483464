//! # Parse-Time Errors
//!
//! Everything that can go wrong while turning request text into a plan.
//! These are deterministic functions of the input and are never retried.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    /// The request body is not a JSON object.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("no [query] registered for [{kind}]")]
    UnsupportedQueryKind { kind: String },

    /// `minimum_should_match` resolved to a threshold other than 1.
    #[error("minimum_should_match resolved to {n}; only a threshold of 1 is supported")]
    UnsupportedThreshold { n: i64 },

    #[error("malformed aggregation: {0}")]
    MalformedAggregation(String),

    #[error("{}", unsupported_aggregation_message(.kind, .enclosing_name.as_deref()))]
    UnsupportedAggregationType {
        kind: String,
        enclosing_name: Option<String>,
    },

    #[error("malformed sort: {0}")]
    MalformedSort(String),
}

impl SearchError {
    /// Search-engine style error type name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "parse_exception",
            Self::MalformedQuery(_) | Self::UnsupportedQueryKind { .. } => "parsing_exception",
            Self::UnsupportedThreshold { .. } => "query_shard_exception",
            Self::MalformedAggregation(_) | Self::UnsupportedAggregationType { .. } => {
                "aggregation_initialization_exception"
            }
            Self::MalformedSort(_) => "sort_parse_exception",
        }
    }
}

fn unsupported_aggregation_message(kind: &str, enclosing: Option<&str>) -> String {
    match enclosing {
        Some(name) => format!("unknown aggregation type [{kind}] in [{name}]"),
        None => format!("unknown aggregation type [{kind}]"),
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_aggregation_mentions_enclosing_name() {
        let err = SearchError::UnsupportedAggregationType {
            kind: "terms".into(),
            enclosing_name: Some("by_user".into()),
        };
        assert_eq!(err.to_string(), "unknown aggregation type [terms] in [by_user]");
    }

    #[test]
    fn test_threshold_message_carries_value() {
        let err = SearchError::UnsupportedThreshold { n: 3 };
        assert!(err.to_string().contains('3'));
        assert_eq!(err.kind(), "query_shard_exception");
    }
}
