//! # Query DSL
//!
//! The predicate half of a search request: boolean combinators over term,
//! match, phrase, id, and range predicates. [`parser`] builds the tree from
//! JSON and [`compiler`] renders it to a parameterized SQL boolean expression.

pub mod compiler;
pub mod parser;

pub use compiler::{compile, resolve_minimum_should_match};
pub use parser::parse;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    MatchAll,
    Term {
        field: String,
        value: Value,
        boost: Option<f64>,
    },
    Type {
        value: String,
        boost: Option<f64>,
    },
    Ids {
        types: Vec<String>,
        values: Vec<String>,
    },
    Match {
        field: String,
        text: String,
        operator: Operator,
        zero_terms: ZeroTermsPolicy,
        mode: MatchMode,
        boost: Option<f64>,
    },
    MultiMatch {
        fields: Vec<BoostedField>,
        text: String,
        mode: MatchMode,
        operator: Operator,
        zero_terms: ZeroTermsPolicy,
    },
    Bool(BoolQuery),
    Terms {
        field: String,
        values: Vec<Value>,
    },
    Range {
        field: String,
        bounds: Vec<(RangeOp, Value)>,
    },
    Exists {
        field: String,
    },
    Prefix {
        field: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoolQuery {
    pub must: Vec<Predicate>,
    pub filter: Vec<Predicate>,
    pub must_not: Vec<Predicate>,
    pub should: Vec<Predicate>,
    /// Raw `minimum_should_match`; resolved against `should.len()` at compile time.
    pub minimum_should_match: Option<String>,
}

/// A `multi_match` target such as `title^2`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoostedField {
    pub name: String,
    pub boost: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operator {
    And,
    #[default]
    Or,
}

impl Operator {
    pub fn sql(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

/// What a match query does when its text has no terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroTermsPolicy {
    #[default]
    None,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Default,
    Phrase,
    PhrasePrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}
