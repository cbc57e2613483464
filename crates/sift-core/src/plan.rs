//! # Search Request Plan
//!
//! The parsed form of one search request body. Building a plan is pure; the
//! plan is immutable afterwards and identified by its source text.

use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::aggs::{self, AggregationNode};
use crate::error::{Result, SearchError};
use crate::query::{self, Predicate};
use crate::sort::{self, SortClause};

pub const DEFAULT_FROM: i64 = 0;
pub const DEFAULT_SIZE: i64 = 10;

/// Request keys that are accepted and have no effect.
const IGNORED_KEYS: &[&str] = &[
    "_source",
    "explain",
    "min_score",
    "stored_fields",
    "timeout",
    "track_scores",
    "track_total_hits",
    "version",
];

/// Knobs that shape parsing but are not part of the request body.
#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Reject unrecognized sort entries instead of skipping them.
    pub strict_sort: bool,
    /// Page size when the request does not name one.
    pub default_size: i64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            strict_sort: false,
            default_size: DEFAULT_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequestPlan {
    predicate: Predicate,
    aggregations: AggregationNode,
    from: i64,
    size: i64,
    sort: Vec<SortClause>,
    source: String,
}

impl SearchRequestPlan {
    /// Build with default options. An empty (or all-whitespace) body is a
    /// match-all request.
    pub fn build(raw: &str) -> Result<Self> {
        Self::build_with(raw, PlanOptions::default())
    }

    pub fn build_with(raw: &str, options: PlanOptions) -> Result<Self> {
        let mut plan = Self {
            predicate: Predicate::MatchAll,
            aggregations: AggregationNode::empty_root(),
            from: DEFAULT_FROM,
            size: options.default_size,
            sort: Vec::new(),
            source: raw.to_string(),
        };
        if raw.trim().is_empty() {
            return Ok(plan);
        }

        let body: Value = serde_json::from_str(raw)
            .map_err(|e| SearchError::MalformedRequest(format!("invalid JSON: {e}")))?;
        let Value::Object(body) = body else {
            return Err(SearchError::MalformedRequest(
                "request body must be a JSON object".into(),
            ));
        };

        let mut seen_aggs = false;
        for (key, value) in &body {
            match key.as_str() {
                "query" => plan.predicate = query::parse(value)?,
                "aggs" | "aggregations" => {
                    if seen_aggs {
                        return Err(SearchError::MalformedAggregation(
                            "both [aggs] and [aggregations] are present".into(),
                        ));
                    }
                    seen_aggs = true;
                    plan.aggregations = aggs::parse(value)?;
                }
                "sort" => plan.sort = sort::parse(value, options.strict_sort)?,
                "from" => plan.from = paging(&body, key, DEFAULT_FROM)?,
                "size" => plan.size = paging(&body, key, options.default_size)?,
                other if IGNORED_KEYS.contains(&other) => {}
                other => {
                    return Err(SearchError::MalformedRequest(format!(
                        "unknown key [{other}] in search request"
                    )))
                }
            }
        }
        Ok(plan)
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn aggregations(&self) -> &AggregationNode {
        &self.aggregations
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn sort(&self) -> &[SortClause] {
        &self.sort
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex SHA-256 of the source text; stable across processes.
    pub fn fingerprint(&self) -> String {
        format!("{:x}", Sha256::digest(self.source.as_bytes()))
    }
}

/// Negative values fall back to the default.
fn paging(body: &Map<String, Value>, key: &str, default: i64) -> Result<i64> {
    let n = match &body[key] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => Some(default),
        _ => None,
    }
    .ok_or_else(|| SearchError::MalformedRequest(format!("[{key}] must be an integer")))?;
    Ok(if n < 0 { default } else { n })
}

impl PartialEq for SearchRequestPlan {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for SearchRequestPlan {}

impl Hash for SearchRequestPlan {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}
