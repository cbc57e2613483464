//! # Aggregation Parser
//!
//! Turns an `aggs`/`aggregations` object into an [`AggregationNode::Root`].
//! Each named entry carries exactly one structural key naming its kind and,
//! for bucket kinds, an optional nested `aggs` object.

use serde_json::{Map, Value};

use super::{AggregationNode, DateFormat, Interval, MetricKind, NamedAggregation};
use crate::error::{Result, SearchError};
use crate::sql::check_field_name;

/// Parse the value of a request's `aggs` key.
pub fn parse(aggs: &Value) -> Result<AggregationNode> {
    Ok(AggregationNode::Root {
        children: parse_children(aggs, "aggs")?,
    })
}

fn parse_children(value: &Value, owner: &str) -> Result<Vec<NamedAggregation>> {
    let map = value.as_object().ok_or_else(|| {
        malformed(format!("sub-aggregations of [{owner}] must be an object"))
    })?;
    map.iter()
        .map(|(name, body)| {
            Ok(NamedAggregation {
                name: name.clone(),
                node: parse_entry(name, body)?,
            })
        })
        .collect()
}

fn parse_entry(name: &str, body: &Value) -> Result<AggregationNode> {
    let entry = body
        .as_object()
        .ok_or_else(|| malformed(format!("aggregation [{name}] must be an object")))?;

    let mut kind: Option<(&str, &Value)> = None;
    let mut sub_aggs: Option<&Value> = None;
    for (key, value) in entry {
        match key.as_str() {
            "aggs" | "aggregations" => {
                if sub_aggs.is_some() {
                    return Err(malformed(format!(
                        "found two sub-aggregation definitions in [{name}]"
                    )));
                }
                sub_aggs = Some(value);
            }
            "meta" => {}
            _ => {
                if let Some((first, _)) = kind {
                    return Err(malformed(format!(
                        "found two aggregation type definitions in [{name}]: [{first}] and [{key}]"
                    )));
                }
                kind = Some((key.as_str(), value));
            }
        }
    }

    let (kind_key, params) =
        kind.ok_or_else(|| malformed(format!("missing aggregation type in [{name}]")))?;

    if kind_key == "date_histogram" {
        let children = match sub_aggs {
            Some(value) => parse_children(value, name)?,
            None => Vec::new(),
        };
        return parse_date_histogram(name, params, children);
    }

    let Some(metric) = MetricKind::from_key(kind_key) else {
        return Err(SearchError::UnsupportedAggregationType {
            kind: kind_key.to_string(),
            enclosing_name: Some(name.to_string()),
        });
    };
    if sub_aggs.is_some() {
        return Err(malformed(format!(
            "aggregation [{name}] of type [{kind_key}] cannot accept sub-aggregations"
        )));
    }
    parse_metric(name, metric, params)
}

fn parse_metric(name: &str, kind: MetricKind, params: &Value) -> Result<AggregationNode> {
    let params = params_object(name, kind.key(), params)?;
    let mut field = None;
    for (key, value) in params {
        match key.as_str() {
            "field" => field = Some(field_param(name, value)?),
            other => return Err(unknown_param(name, other)),
        }
    }
    let field = field.ok_or_else(|| {
        malformed(format!("required [field] missing in [{}] aggregation [{name}]", kind.key()))
    })?;
    Ok(AggregationNode::Metric { kind, field })
}

fn parse_date_histogram(
    name: &str,
    params: &Value,
    children: Vec<NamedAggregation>,
) -> Result<AggregationNode> {
    let params = params_object(name, "date_histogram", params)?;
    let mut field = None;
    let mut interval = None;
    let mut format = None;
    for (key, value) in params {
        match key.as_str() {
            "field" => field = Some(field_param(name, value)?),
            "interval" | "calendar_interval" | "fixed_interval" => {
                if interval.is_some() {
                    return Err(malformed(format!(
                        "date_histogram [{name}] declares more than one interval"
                    )));
                }
                let raw = value.as_str().ok_or_else(|| {
                    malformed(format!("[{key}] of date_histogram [{name}] must be a string"))
                })?;
                interval = Some(Interval::parse(raw).ok_or_else(|| {
                    malformed(format!("unsupported interval [{raw}] in date_histogram [{name}]"))
                })?);
            }
            "format" => {
                let raw = value.as_str().ok_or_else(|| {
                    malformed(format!("[format] of date_histogram [{name}] must be a string"))
                })?;
                format = Some(DateFormat::parse(raw).map_err(malformed)?);
            }
            "time_zone" => match value.as_str() {
                Some("UTC" | "Z" | "+00:00" | "Etc/UTC") => {}
                _ => {
                    return Err(malformed(format!(
                        "date_histogram [{name}] only supports the UTC time_zone"
                    )))
                }
            },
            other => return Err(unknown_param(name, other)),
        }
    }

    let field = field
        .ok_or_else(|| malformed(format!("required [field] missing in date_histogram [{name}]")))?;
    let interval = interval.ok_or_else(|| {
        malformed(format!("required [interval] missing in date_histogram [{name}]"))
    })?;
    Ok(AggregationNode::DateHistogram {
        field,
        interval,
        format,
        children,
    })
}

fn params_object<'a>(name: &str, kind: &str, params: &'a Value) -> Result<&'a Map<String, Value>> {
    params
        .as_object()
        .ok_or_else(|| malformed(format!("[{kind}] body of aggregation [{name}] must be an object")))
}

fn field_param(name: &str, value: &Value) -> Result<String> {
    let field = value
        .as_str()
        .ok_or_else(|| malformed(format!("[field] of aggregation [{name}] must be a string")))?;
    check_field_name(field).map_err(malformed)?;
    Ok(field.to_string())
}

fn unknown_param(name: &str, param: &str) -> SearchError {
    malformed(format!("unknown parameter [{param}] in aggregation [{name}]"))
}

fn malformed(msg: impl Into<String>) -> SearchError {
    SearchError::MalformedAggregation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(node: &AggregationNode) -> Vec<&str> {
        node.children().iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_parse_metric() {
        let root = parse(&json!({ "total": { "sum": { "field": "price" } } })).unwrap();
        assert_eq!(
            root.children()[0].node,
            AggregationNode::Metric {
                kind: MetricKind::Sum,
                field: "price".into()
            }
        );
    }

    #[test]
    fn test_nested_histogram_keeps_source_order() {
        let root = parse(&json!({
            "zeta": { "max": { "field": "a" } },
            "per_day": {
                "date_histogram": { "field": "ts", "interval": "day" },
                "aggs": {
                    "b_sum": { "sum": { "field": "b" } },
                    "a_avg": { "avg": { "field": "a" } }
                }
            },
            "alpha": { "min": { "field": "a" } }
        }))
        .unwrap();
        assert_eq!(names(&root), vec!["zeta", "per_day", "alpha"]);
        assert_eq!(names(&root.children()[1].node), vec!["b_sum", "a_avg"]);
    }

    #[test]
    fn test_reserialization_reproduces_key_order() {
        let source = json!({
            "z": { "date_histogram": { "field": "ts", "interval": "month", "format": "yyyy-MM" },
                   "aggs": { "y": { "sum": { "field": "n" } }, "x": { "avg": { "field": "n" } } } },
            "a": { "value_count": { "field": "n" } }
        });
        let root = parse(&source).unwrap();
        let out = root.to_json();
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
        let nested: Vec<&String> = out["z"]["aggs"].as_object().unwrap().keys().collect();
        assert_eq!(nested, vec!["y", "x"]);
        assert_eq!(parse(&out).unwrap(), root);
    }

    #[test]
    fn test_unknown_kind_names_the_aggregation() {
        let err = parse(&json!({ "by_user": { "terms": { "field": "user" } } })).unwrap_err();
        assert_eq!(
            err,
            SearchError::UnsupportedAggregationType {
                kind: "terms".into(),
                enclosing_name: Some("by_user".into())
            }
        );
    }

    #[test]
    fn test_metric_requires_field() {
        let err = parse(&json!({ "total": { "sum": {} } })).unwrap_err();
        assert!(matches!(err, SearchError::MalformedAggregation(_)));
    }

    #[test]
    fn test_metric_rejects_sub_aggregations() {
        let err = parse(&json!({
            "total": { "sum": { "field": "p" }, "aggs": { "x": { "max": { "field": "p" } } } }
        }))
        .unwrap_err();
        assert!(matches!(err, SearchError::MalformedAggregation(_)));
    }

    #[test]
    fn test_two_kinds_in_one_entry() {
        let err = parse(&json!({ "x": { "sum": { "field": "a" }, "max": { "field": "a" } } }))
            .unwrap_err();
        assert!(matches!(err, SearchError::MalformedAggregation(_)));
    }

    #[test]
    fn test_histogram_interval_validation() {
        let missing = parse(&json!({ "h": { "date_histogram": { "field": "ts" } } }));
        assert!(matches!(missing, Err(SearchError::MalformedAggregation(_))));
        let bad = parse(&json!({ "h": { "date_histogram": { "field": "ts", "interval": "7d" } } }));
        assert!(matches!(bad, Err(SearchError::MalformedAggregation(_))));
        let ok = parse(&json!({
            "h": { "date_histogram": { "field": "ts", "calendar_interval": "1d" } }
        }))
        .unwrap();
        assert!(matches!(
            ok.children()[0].node,
            AggregationNode::DateHistogram { interval: Interval::Day, .. }
        ));
    }

    #[test]
    fn test_unknown_kind_inside_bucket() {
        let err = parse(&json!({
            "h": { "date_histogram": { "field": "ts", "interval": "day" },
                   "aggs": { "pct": { "percentiles": { "field": "x" } } } }
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            SearchError::UnsupportedAggregationType { ref kind, .. } if kind == "percentiles"
        ));
    }

    #[test]
    fn test_empty_aggs() {
        assert!(parse(&json!({})).unwrap().is_empty());
        assert!(parse(&json!([])).is_err());
    }
}
