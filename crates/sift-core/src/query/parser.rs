//! # Query DSL Parser
//!
//! Parses a JSON query object into a [`Predicate`] tree. Every node is an
//! object with exactly one key naming its kind:
//!
//! ```text
//! {"bool": {"must": [{"match": {"title": "rust"}}], "filter": {"term": {"lang": "en"}}}}
//! ```

use serde_json::{Map, Value};

use super::{
    BoolQuery, BoostedField, MatchMode, Operator, Predicate, RangeOp, ZeroTermsPolicy,
};
use crate::error::{Result, SearchError};
use crate::sql::check_field_name;

/// Parse the value of a request's `query` key.
pub fn parse(query: &Value) -> Result<Predicate> {
    let obj = query
        .as_object()
        .ok_or_else(|| malformed("query must be an object"))?;

    let mut entries = obj.iter();
    let (kind, body) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        (None, _) => return Err(malformed("query object must not be empty")),
        (Some((first, _)), Some((second, _))) => {
            return Err(malformed(format!(
                "[{first}] malformed query, expected [END_OBJECT] but found [{second}]"
            )))
        }
    };

    match kind.as_str() {
        "match_all" => parse_match_all(body),
        "bool" => parse_bool(body),
        "match" => parse_match(kind, body, None),
        "match_phrase" => parse_match(kind, body, Some(MatchMode::Phrase)),
        "match_phrase_prefix" => parse_match(kind, body, Some(MatchMode::PhrasePrefix)),
        "multi_match" => parse_multi_match(body),
        "term" => parse_term(body),
        "terms" => parse_terms(body),
        "type" => parse_type(body),
        "ids" => parse_ids(body),
        "range" => parse_range(body),
        "exists" => parse_exists(body),
        "prefix" => parse_prefix(body),
        other => Err(SearchError::UnsupportedQueryKind {
            kind: other.to_string(),
        }),
    }
}

fn parse_match_all(body: &Value) -> Result<Predicate> {
    let params = object(body, "match_all")?;
    for (key, value) in params {
        match key.as_str() {
            "boost" => {
                number(value, "match_all", key)?;
            }
            other => return Err(unknown_param("match_all", other)),
        }
    }
    Ok(Predicate::MatchAll)
}

fn parse_bool(body: &Value) -> Result<Predicate> {
    let params = object(body, "bool")?;
    let mut query = BoolQuery::default();
    for (key, value) in params {
        match key.as_str() {
            "must" => query.must = clauses(value)?,
            "filter" => query.filter = clauses(value)?,
            "must_not" => query.must_not = clauses(value)?,
            "should" => query.should = clauses(value)?,
            "minimum_should_match" => {
                query.minimum_should_match = Some(match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) if n.is_i64() => n.to_string(),
                    _ => {
                        return Err(malformed(
                            "[minimum_should_match] must be an integer or a string",
                        ))
                    }
                });
            }
            "boost" => {
                number(value, "bool", key)?;
            }
            other => return Err(unknown_param("bool", other)),
        }
    }
    Ok(Predicate::Bool(query))
}

/// A clause list; a bare object counts as a single clause.
fn clauses(value: &Value) -> Result<Vec<Predicate>> {
    match value {
        Value::Array(items) => items.iter().map(parse).collect(),
        Value::Object(_) => Ok(vec![parse(value)?]),
        _ => Err(malformed("bool clauses must be a query object or an array")),
    }
}

fn parse_match(kind: &str, body: &Value, implicit: Option<MatchMode>) -> Result<Predicate> {
    let (field, spec) = single_field(kind, body)?;

    let mut text = None;
    let mut operator = Operator::Or;
    let mut zero_terms = ZeroTermsPolicy::None;
    let mut mode = implicit.unwrap_or_default();
    let mut boost = None;

    match spec {
        Value::Object(params) => {
            for (key, value) in params {
                match key.as_str() {
                    "query" => text = Some(scalar_text(value, kind, key)?),
                    "operator" => operator = parse_operator(value, kind)?,
                    "zero_terms_query" => zero_terms = parse_zero_terms(value, kind)?,
                    "boost" => boost = Some(number(value, kind, key)?),
                    "type" if implicit.is_none() => {
                        mode = match value.as_str() {
                            Some("boolean") => MatchMode::Default,
                            Some("phrase") => MatchMode::Phrase,
                            Some("phrase_prefix") => MatchMode::PhrasePrefix,
                            _ => return Err(malformed(format!("[{kind}] unknown type {value}"))),
                        };
                    }
                    // analysis is not performed; accepted for compatibility
                    "analyzer" | "max_expansions" => {}
                    other => return Err(unknown_param(kind, other)),
                }
            }
        }
        scalar => text = Some(scalar_text(scalar, kind, "query")?),
    }

    let text = text.ok_or_else(|| malformed(format!("[{kind}] requires [query]")))?;
    Ok(Predicate::Match {
        field,
        text,
        operator,
        zero_terms,
        mode,
        boost,
    })
}

fn parse_multi_match(body: &Value) -> Result<Predicate> {
    const KIND: &str = "multi_match";
    let params = object(body, KIND)?;

    let mut text = None;
    let mut fields = Vec::new();
    let mut mode = MatchMode::Default;
    let mut operator = Operator::Or;
    let mut zero_terms = ZeroTermsPolicy::None;

    for (key, value) in params {
        match key.as_str() {
            "query" => text = Some(scalar_text(value, KIND, key)?),
            "fields" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| malformed("[multi_match] [fields] must be an array"))?;
                for item in items {
                    let raw = item
                        .as_str()
                        .ok_or_else(|| malformed("[multi_match] field names must be strings"))?;
                    fields.push(boosted_field(raw)?);
                }
            }
            "type" => {
                mode = match value.as_str() {
                    Some("best_fields" | "most_fields" | "cross_fields") => MatchMode::Default,
                    Some("phrase") => MatchMode::Phrase,
                    Some("phrase_prefix") => MatchMode::PhrasePrefix,
                    _ => return Err(malformed(format!("[multi_match] unknown type {value}"))),
                };
            }
            "operator" => operator = parse_operator(value, KIND)?,
            "zero_terms_query" => zero_terms = parse_zero_terms(value, KIND)?,
            "boost" => {
                number(value, KIND, key)?;
            }
            "analyzer" | "tie_breaker" => {}
            other => return Err(unknown_param(KIND, other)),
        }
    }

    let text = text.ok_or_else(|| malformed("[multi_match] requires [query]"))?;
    if fields.is_empty() {
        return Err(malformed("[multi_match] requires at least one field"));
    }
    Ok(Predicate::MultiMatch {
        fields,
        text,
        mode,
        operator,
        zero_terms,
    })
}

/// `title^2.5` → (`title`, 2.5)
fn boosted_field(raw: &str) -> Result<BoostedField> {
    let (name, boost) = match raw.rsplit_once('^') {
        Some((name, boost)) => {
            let boost: f64 = boost
                .parse()
                .map_err(|_| malformed(format!("invalid boost in field [{raw}]")))?;
            (name, Some(boost))
        }
        None => (raw, None),
    };
    check_field_name(name).map_err(malformed)?;
    Ok(BoostedField {
        name: name.to_string(),
        boost,
    })
}

fn parse_term(body: &Value) -> Result<Predicate> {
    let (field, spec) = single_field("term", body)?;
    let (value, boost) = match spec {
        Value::Object(params) => {
            let mut value = None;
            let mut boost = None;
            for (key, v) in params {
                match key.as_str() {
                    "value" => value = Some(scalar(v, "term")?.clone()),
                    "boost" => boost = Some(number(v, "term", key)?),
                    other => return Err(unknown_param("term", other)),
                }
            }
            (
                value.ok_or_else(|| malformed("[term] requires [value]"))?,
                boost,
            )
        }
        other => (scalar(other, "term")?.clone(), None),
    };
    Ok(Predicate::Term {
        field,
        value,
        boost,
    })
}

fn parse_terms(body: &Value) -> Result<Predicate> {
    let params = object(body, "terms")?;
    let mut target = None;
    for (key, value) in params {
        if key == "boost" {
            number(value, "terms", key)?;
            continue;
        }
        if target.is_some() {
            return Err(malformed("[terms] query does not support multiple fields"));
        }
        let items = value
            .as_array()
            .ok_or_else(|| malformed(format!("[terms] values for [{key}] must be an array")))?;
        let values = items
            .iter()
            .map(|v| scalar(v, "terms").cloned())
            .collect::<Result<Vec<_>>>()?;
        target = Some((field_name(key)?, values));
    }
    let (field, values) = target.ok_or_else(|| malformed("[terms] requires a field"))?;
    Ok(Predicate::Terms { field, values })
}

fn parse_type(body: &Value) -> Result<Predicate> {
    let params = object(body, "type")?;
    let mut value = None;
    let mut boost = None;
    for (key, v) in params {
        match key.as_str() {
            "value" => value = Some(scalar_text(v, "type", key)?),
            "boost" => boost = Some(number(v, "type", key)?),
            other => return Err(unknown_param("type", other)),
        }
    }
    let value = value.ok_or_else(|| malformed("[type] requires [value]"))?;
    Ok(Predicate::Type { value, boost })
}

fn parse_ids(body: &Value) -> Result<Predicate> {
    let params = object(body, "ids")?;
    let mut types = Vec::new();
    let mut values = None;
    for (key, v) in params {
        match key.as_str() {
            "type" | "types" => types = string_list(v, "ids", key)?,
            "values" => values = Some(string_list(v, "ids", key)?),
            "boost" => {
                number(v, "ids", key)?;
            }
            other => return Err(unknown_param("ids", other)),
        }
    }
    let values = values.ok_or_else(|| malformed("[ids] requires [values]"))?;
    Ok(Predicate::Ids { types, values })
}

fn parse_range(body: &Value) -> Result<Predicate> {
    let (field, spec) = single_field("range", body)?;
    let params = object(spec, "range")?;
    let mut bounds = Vec::new();
    for (key, value) in params {
        if let Some(op) = RangeOp::from_key(key) {
            bounds.push((op, scalar(value, "range")?.clone()));
            continue;
        }
        match key.as_str() {
            "boost" => {
                number(value, "range", key)?;
            }
            other => return Err(unknown_param("range", other)),
        }
    }
    if bounds.is_empty() {
        return Err(malformed(format!("[range] on [{field}] requires at least one bound")));
    }
    Ok(Predicate::Range { field, bounds })
}

fn parse_exists(body: &Value) -> Result<Predicate> {
    let params = object(body, "exists")?;
    let mut field = None;
    for (key, value) in params {
        match key.as_str() {
            "field" => {
                let name = value
                    .as_str()
                    .ok_or_else(|| malformed("[exists] [field] must be a string"))?;
                field = Some(field_name(name)?);
            }
            "boost" => {
                number(value, "exists", key)?;
            }
            other => return Err(unknown_param("exists", other)),
        }
    }
    let field = field.ok_or_else(|| malformed("[exists] requires [field]"))?;
    Ok(Predicate::Exists { field })
}

fn parse_prefix(body: &Value) -> Result<Predicate> {
    let (field, spec) = single_field("prefix", body)?;
    let value = match spec {
        Value::Object(params) => {
            let mut value = None;
            for (key, v) in params {
                match key.as_str() {
                    "value" | "prefix" => value = Some(scalar_text(v, "prefix", key)?),
                    "boost" => {
                        number(v, "prefix", key)?;
                    }
                    other => return Err(unknown_param("prefix", other)),
                }
            }
            value.ok_or_else(|| malformed("[prefix] requires [value]"))?
        }
        other => scalar_text(other, "prefix", "value")?,
    };
    Ok(Predicate::Prefix { field, value })
}

// =============================================================================
// Helpers
// =============================================================================

fn object<'a>(value: &'a Value, kind: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| malformed(format!("[{kind}] query malformed, expected an object")))
}

/// `{"field": spec}`, the shape shared by term, match, range, and prefix.
fn single_field<'a>(kind: &str, body: &'a Value) -> Result<(String, &'a Value)> {
    let params = object(body, kind)?;
    let mut entries = params.iter();
    match (entries.next(), entries.next()) {
        (Some((field, spec)), None) => Ok((field_name(field)?, spec)),
        (None, _) => Err(malformed(format!("[{kind}] query requires a field"))),
        (Some(_), Some(_)) => Err(malformed(format!(
            "[{kind}] query doesn't support multiple fields"
        ))),
    }
}

fn field_name(name: &str) -> Result<String> {
    check_field_name(name).map_err(malformed)?;
    Ok(name.to_string())
}

fn scalar<'a>(value: &'a Value, kind: &str) -> Result<&'a Value> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(value),
        _ => Err(malformed(format!("[{kind}] values must be strings, numbers, or booleans"))),
    }
}

fn scalar_text(value: &Value, kind: &str, key: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(malformed(format!("[{kind}] [{key}] must be a scalar"))),
    }
}

fn number(value: &Value, kind: &str, key: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| malformed(format!("[{kind}] [{key}] must be a number")))
}

fn string_list(value: &Value, kind: &str, key: &str) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(|v| scalar_text(v, kind, key)).collect(),
        other => Ok(vec![scalar_text(other, kind, key)?]),
    }
}

fn parse_operator(value: &Value, kind: &str) -> Result<Operator> {
    match value.as_str().map(str::to_ascii_lowercase).as_deref() {
        Some("and") => Ok(Operator::And),
        Some("or") => Ok(Operator::Or),
        _ => Err(malformed(format!("[{kind}] unknown operator {value}"))),
    }
}

fn parse_zero_terms(value: &Value, kind: &str) -> Result<ZeroTermsPolicy> {
    match value.as_str().map(str::to_ascii_lowercase).as_deref() {
        Some("none") => Ok(ZeroTermsPolicy::None),
        Some("all") => Ok(ZeroTermsPolicy::All),
        _ => Err(malformed(format!("[{kind}] unknown zero_terms_query {value}"))),
    }
}

fn unknown_param(kind: &str, param: &str) -> SearchError {
    malformed(format!("[{kind}] query does not support [{param}]"))
}

fn malformed(msg: impl Into<String>) -> SearchError {
    SearchError::MalformedQuery(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_term_with_value_object() {
        let q = parse(&json!({ "term": { "user": { "value": "kimchy", "boost": 2.0 } } })).unwrap();
        assert_eq!(
            q,
            Predicate::Term {
                field: "user".into(),
                value: json!("kimchy"),
                boost: Some(2.0)
            }
        );
    }

    #[test]
    fn test_bare_match_defaults_to_or() {
        let q = parse(&json!({ "match": { "title": "quick fox" } })).unwrap();
        match q {
            Predicate::Match {
                operator, mode, text, ..
            } => {
                assert_eq!(operator, Operator::Or);
                assert_eq!(mode, MatchMode::Default);
                assert_eq!(text, "quick fox");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_match_type_selects_mode() {
        let q = parse(&json!({
            "match": { "title": { "query": "quick fox", "type": "phrase_prefix", "operator": "AND" } }
        }))
        .unwrap();
        assert!(matches!(
            q,
            Predicate::Match { mode: MatchMode::PhrasePrefix, operator: Operator::And, .. }
        ));
    }

    #[test]
    fn test_match_phrase_rejects_type() {
        let err = parse(&json!({ "match_phrase": { "t": { "query": "a", "type": "boolean" } } }));
        assert!(matches!(err, Err(SearchError::MalformedQuery(_))));
    }

    #[test]
    fn test_bool_accepts_bare_object_clause() {
        let q = parse(&json!({
            "bool": {
                "must": { "term": { "a": 1 } },
                "should": [{ "term": { "b": 2 } }, { "match_all": {} }],
                "minimum_should_match": 1
            }
        }))
        .unwrap();
        let Predicate::Bool(b) = q else { panic!("expected bool") };
        assert_eq!(b.must.len(), 1);
        assert_eq!(b.should.len(), 2);
        assert_eq!(b.minimum_should_match.as_deref(), Some("1"));
    }

    #[test]
    fn test_multi_match_field_boosts() {
        let q = parse(&json!({
            "multi_match": { "query": "rust", "fields": ["title^3", "body"], "type": "phrase" }
        }))
        .unwrap();
        let Predicate::MultiMatch { fields, mode, .. } = q else { panic!("expected multi_match") };
        assert_eq!(mode, MatchMode::Phrase);
        assert_eq!(fields[0].name, "title");
        assert_eq!(fields[0].boost, Some(3.0));
        assert_eq!(fields[1].boost, None);
    }

    #[test]
    fn test_ids_with_single_type() {
        let q = parse(&json!({ "ids": { "type": "tweet", "values": ["1", 2] } })).unwrap();
        assert_eq!(
            q,
            Predicate::Ids {
                types: vec!["tweet".into()],
                values: vec!["1".into(), "2".into()]
            }
        );
    }

    #[test]
    fn test_unknown_kind() {
        let err = parse(&json!({ "fuzzy": { "user": "ki" } })).unwrap_err();
        assert_eq!(
            err,
            SearchError::UnsupportedQueryKind {
                kind: "fuzzy".into()
            }
        );
    }

    #[test]
    fn test_two_kinds_is_malformed() {
        let err = parse(&json!({ "term": { "a": 1 }, "match": { "b": "x" } })).unwrap_err();
        assert!(matches!(err, SearchError::MalformedQuery(_)));
    }

    #[test]
    fn test_term_rejects_array_value() {
        let err = parse(&json!({ "term": { "a": [1, 2] } })).unwrap_err();
        assert!(matches!(err, SearchError::MalformedQuery(_)));
    }

    #[test]
    fn test_unknown_parameter_is_malformed() {
        let err = parse(&json!({ "match": { "t": { "query": "x", "fuzziness": 2 } } })).unwrap_err();
        assert!(matches!(err, SearchError::MalformedQuery(_)));
    }

    #[test]
    fn test_range_requires_a_bound() {
        assert!(parse(&json!({ "range": { "age": {} } })).is_err());
        let q = parse(&json!({ "range": { "age": { "gte": 10, "lt": 20 } } })).unwrap();
        assert_eq!(
            q,
            Predicate::Range {
                field: "age".into(),
                bounds: vec![(RangeOp::Gte, json!(10)), (RangeOp::Lt, json!(20))]
            }
        );
    }

    #[test]
    fn test_bad_field_name() {
        let err = parse(&json!({ "term": { "we\"ird": "x" } })).unwrap_err();
        assert!(matches!(err, SearchError::MalformedQuery(_)));
    }
}
