//! # Sort Compiler
//!
//! Accepted shapes, alone or in an array:
//!
//! ```text
//! "ts"                              ascending
//! {"ts": "desc"}
//! {"ts": {"order": "desc"}}
//! ```
//!
//! `_score` entries are dropped since hits are not scored.

use serde_json::Value;

use crate::error::{Result, SearchError};
use crate::sql::{check_field_name, field_expr, SqlDialect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortClause {
    pub field: String,
    pub ascending: bool,
}

/// Parse a request's `sort` value. With `strict` unset, unrecognized entries
/// are skipped instead of rejected.
pub fn parse(sort: &Value, strict: bool) -> Result<Vec<SortClause>> {
    let entries = match sort {
        Value::Array(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };

    let mut clauses = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_entry(entry) {
            Ok(Some(clause)) => clauses.push(clause),
            Ok(None) => {}
            Err(err) if strict => return Err(err),
            Err(_) => {}
        }
    }
    Ok(clauses)
}

fn parse_entry(entry: &Value) -> Result<Option<SortClause>> {
    let (field, ascending) = match entry {
        Value::String(field) => (field.as_str(), true),
        Value::Object(map) if map.len() == 1 => {
            let Some((field, spec)) = map.iter().next() else {
                return Err(malformed("empty sort object"));
            };
            let order = match spec {
                Value::String(order) => order.as_str(),
                Value::Object(opts) => opts
                    .get("order")
                    .and_then(Value::as_str)
                    .unwrap_or(if field == "_score" { "desc" } else { "asc" }),
                other => return Err(malformed(format!("unsupported sort spec for [{field}]: {other}"))),
            };
            (field.as_str(), parse_order(order)?)
        }
        other => return Err(malformed(format!("unsupported sort entry {other}"))),
    };

    if field == "_score" {
        return Ok(None);
    }
    check_field_name(field).map_err(malformed)?;
    Ok(Some(SortClause {
        field: field.to_string(),
        ascending,
    }))
}

fn parse_order(order: &str) -> Result<bool> {
    match order.to_ascii_lowercase().as_str() {
        "asc" => Ok(true),
        "desc" => Ok(false),
        other => Err(malformed(format!("unknown sort order [{other}]"))),
    }
}

/// `ORDER BY a ASC, b DESC`, or empty when there is nothing to sort by.
pub fn compile(clauses: &[SortClause], dialect: &dyn SqlDialect) -> String {
    if clauses.is_empty() {
        return String::new();
    }
    let items: Vec<String> = clauses
        .iter()
        .map(|c| {
            format!(
                "{} {}",
                field_expr(dialect, &c.field),
                if c.ascending { "ASC" } else { "DESC" }
            )
        })
        .collect();
    format!("ORDER BY {}", items.join(", "))
}

fn malformed(msg: impl Into<String>) -> SearchError {
    SearchError::MalformedSort(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::SQLITE;
    use serde_json::json;

    #[test]
    fn test_all_shapes() {
        let clauses = parse(
            &json!(["a", { "b": "desc" }, { "c": { "order": "ASC" } }, "_score"]),
            true,
        )
        .unwrap();
        assert_eq!(
            clauses,
            vec![
                SortClause { field: "a".into(), ascending: true },
                SortClause { field: "b".into(), ascending: false },
                SortClause { field: "c".into(), ascending: true },
            ]
        );
        assert_eq!(
            compile(&clauses, &SQLITE),
            "ORDER BY doc ->> '$.a' ASC, doc ->> '$.b' DESC, doc ->> '$.c' ASC"
        );
    }

    #[test]
    fn test_single_entry_without_array() {
        let clauses = parse(&json!({ "_id": "desc" }), true).unwrap();
        assert_eq!(compile(&clauses, &SQLITE), "ORDER BY id DESC");
    }

    #[test]
    fn test_lenient_skips_malformed_entries() {
        let source = json!(["a", 42, { "b": "sideways" }]);
        let clauses = parse(&source, false).unwrap();
        assert_eq!(clauses.len(), 1);
        let err = parse(&source, true).unwrap_err();
        assert!(matches!(err, SearchError::MalformedSort(_)));
    }

    #[test]
    fn test_empty_sort_compiles_to_nothing() {
        assert_eq!(compile(&[], &SQLITE), "");
    }
}
