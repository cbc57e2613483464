//! # Aggregation Tree
//!
//! The typed form of a request's `aggs` object. Children keep the key order
//! of the source document; that order is the key order of the results.

pub mod interval;
pub mod parser;

pub use interval::{DateFormat, Interval};
pub use parser::parse;

use serde_json::{json, Map, Value};

/// Terminal single-value aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Sum,
    Min,
    Max,
    Avg,
    ValueCount,
}

impl MetricKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "sum" => Some(Self::Sum),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "avg" => Some(Self::Avg),
            "value_count" => Some(Self::ValueCount),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::ValueCount => "value_count",
        }
    }

    /// The SQL aggregate function applied to the field.
    pub fn sql_function(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Avg => "AVG",
            Self::ValueCount => "COUNT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationNode {
    /// The top-level `aggs` object.
    Root { children: Vec<NamedAggregation> },
    Metric { kind: MetricKind, field: String },
    DateHistogram {
        field: String,
        interval: Interval,
        format: Option<DateFormat>,
        children: Vec<NamedAggregation>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedAggregation {
    pub name: String,
    pub node: AggregationNode,
}

impl AggregationNode {
    pub fn empty_root() -> Self {
        Self::Root {
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> &[NamedAggregation] {
        match self {
            Self::Root { children } | Self::DateHistogram { children, .. } => children,
            Self::Metric { .. } => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children().is_empty()
    }

    /// Serialize back to request syntax. A `Root` becomes the `aggs` object
    /// itself; other nodes become the body of one named entry.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Root { children } => children_to_json(children),
            Self::Metric { kind, field } => {
                let mut entry = Map::new();
                entry.insert(kind.key().into(), json!({ "field": field }));
                Value::Object(entry)
            }
            Self::DateHistogram {
                field,
                interval,
                format,
                children,
            } => {
                let mut body = Map::new();
                body.insert("field".into(), json!(field));
                body.insert("interval".into(), json!(interval.unit()));
                if let Some(format) = format {
                    body.insert("format".into(), json!(format.pattern()));
                }
                let mut entry = Map::new();
                entry.insert("date_histogram".into(), Value::Object(body));
                if !children.is_empty() {
                    entry.insert("aggs".into(), children_to_json(children));
                }
                Value::Object(entry)
            }
        }
    }
}

fn children_to_json(children: &[NamedAggregation]) -> Value {
    let map: Map<String, Value> = children
        .iter()
        .map(|c| (c.name.clone(), c.node.to_json()))
        .collect();
    Value::Object(map)
}
