//! # Predicate Compiler
//!
//! Renders a [`Predicate`] tree into a single SQL boolean expression. The
//! output is a pure function of the tree and the dialect: equal trees produce
//! byte-identical SQL and parameter lists.
//!
//! Shapes:
//!
//! ```text
//! term        sift_text(doc -> '$.user') = ?
//! match       (sift_text(doc -> '$.t') LIKE ? ESCAPE '\' OR ...)
//! range       sift_numeric(doc ->> '$.n') >= ?
//! bool        (must) AND (filter) AND NOT (must_not) AND (should)
//! ```

use serde_json::Value;

use super::{BoolQuery, MatchMode, Operator, Predicate, ZeroTermsPolicy};
use crate::error::{Result, SearchError};
use crate::sql::{escape_like, field_expr, field_text, SqlDialect, SqlFragment, SqlValue};

/// Compile a predicate into a WHERE-clause body. `MatchAll` yields an empty
/// fragment, meaning "no WHERE clause".
pub fn compile(predicate: &Predicate, dialect: &dyn SqlDialect) -> Result<SqlFragment> {
    match predicate {
        Predicate::MatchAll => Ok(SqlFragment::empty()),
        Predicate::Term { field, value, .. } => Ok(compile_term(field, value, dialect)),
        Predicate::Type { value, .. } => {
            Ok(SqlFragment::bound("type = ?", vec![value.as_str().into()]))
        }
        Predicate::Ids { types, values } => Ok(compile_ids(types, values)),
        Predicate::Match {
            field,
            text,
            operator,
            zero_terms,
            mode,
            ..
        } => Ok(compile_match(
            &[field.as_str()],
            text,
            *mode,
            *operator,
            *zero_terms,
            dialect,
        )),
        Predicate::MultiMatch {
            fields,
            text,
            mode,
            operator,
            zero_terms,
        } => {
            let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            Ok(compile_match(&names, text, *mode, *operator, *zero_terms, dialect))
        }
        Predicate::Bool(query) => compile_bool(query, dialect),
        Predicate::Terms { field, values } => {
            if values.is_empty() {
                return Ok(SqlFragment::never());
            }
            let params: Vec<SqlValue> = values.iter().map(|v| bind(field, v, dialect)).collect();
            Ok(SqlFragment::bound(
                format!("{} IN ({})", field_text(dialect, field), placeholders(params.len())),
                params,
            ))
        }
        Predicate::Range { field, bounds } => {
            let parts = bounds
                .iter()
                .map(|(op, value)| {
                    let (lhs, param) = match value {
                        Value::Number(n) => (
                            dialect.numeric(&field_expr(dialect, field)),
                            number_param(n),
                        ),
                        _ => (field_text(dialect, field), bind(field, value, dialect)),
                    };
                    SqlFragment::bound(format!("{lhs} {} ?", op.sql()), vec![param])
                })
                .collect();
            Ok(SqlFragment::join(parts, " AND "))
        }
        Predicate::Exists { field } => Ok(SqlFragment::raw(format!(
            "{} IS NOT NULL",
            field_expr(dialect, field)
        ))),
        Predicate::Prefix { field, value } => Ok(like(
            &field_text(dialect, field),
            format!("{}%", escape_like(value)),
        )),
    }
}

/// Resolve a raw `minimum_should_match` against the number of should clauses.
///
/// `"2"` and `2` are absolute counts, `"-1"` means "all but one", `"50%"`
/// rounds half up, and `"-25%"` is read as `"75%"`. Absent means 1.
pub fn resolve_minimum_should_match(raw: Option<&str>, count: usize) -> Result<i64> {
    let Some(raw) = raw.map(str::trim) else {
        return Ok(1);
    };
    let count = count as i64;
    let invalid = || SearchError::MalformedQuery(format!("invalid minimum_should_match [{raw}]"));

    if let Some(percent) = raw.strip_suffix('%') {
        let mut p: f64 = percent.trim().parse().map_err(|_| invalid())?;
        if p < 0.0 {
            p += 100.0;
        }
        return Ok((count as f64 * p / 100.0 + 0.5).floor() as i64);
    }

    let n: i64 = raw.parse().map_err(|_| invalid())?;
    Ok(if n < 0 { count + n } else { n })
}

fn compile_term(field: &str, value: &Value, dialect: &dyn SqlDialect) -> SqlFragment {
    SqlFragment::bound(
        format!("{} = ?", field_text(dialect, field)),
        vec![bind(field, value, dialect)],
    )
}

/// Equality operands are text on both sides of the comparison.
fn bind(field: &str, value: &Value, dialect: &dyn SqlDialect) -> SqlValue {
    match (field, value) {
        ("_id" | "_type", Value::String(s)) => SqlValue::Text(s.clone()),
        ("_id" | "_type", other) => SqlValue::Text(other.to_string()),
        _ => dialect.bind_scalar(value),
    }
}

/// Range bounds against the numeric cast bind as numbers.
fn number_param(n: &serde_json::Number) -> SqlValue {
    match n.as_i64() {
        Some(i) => SqlValue::Integer(i),
        None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    }
}

fn compile_ids(types: &[String], values: &[String]) -> SqlFragment {
    if values.is_empty() {
        return SqlFragment::never();
    }
    let in_list = |column: &str, items: &[String]| {
        SqlFragment::bound(
            format!("({column} IN ({}))", placeholders(items.len())),
            items.iter().map(|s| s.as_str().into()).collect(),
        )
    };
    let mut parts = Vec::with_capacity(2);
    if !types.is_empty() {
        parts.push(in_list("type", types));
    }
    parts.push(in_list("id", values));
    SqlFragment::join(parts, " AND ")
}

fn compile_match(
    fields: &[&str],
    text: &str,
    mode: MatchMode,
    operator: Operator,
    zero_terms: ZeroTermsPolicy,
    dialect: &dyn SqlDialect,
) -> SqlFragment {
    let patterns: Vec<String> = match mode {
        MatchMode::Default => text
            .split_whitespace()
            .map(|term| format!("%{}%", escape_like(term)))
            .collect(),
        MatchMode::Phrase if !text.trim().is_empty() => vec![escape_like(text)],
        MatchMode::PhrasePrefix if !text.trim().is_empty() => {
            vec![format!("{}%", escape_like(text))]
        }
        _ => Vec::new(),
    };

    if patterns.is_empty() {
        return match zero_terms {
            ZeroTermsPolicy::None => SqlFragment::never(),
            ZeroTermsPolicy::All => SqlFragment::empty(),
        };
    }

    let exprs: Vec<String> = fields.iter().map(|f| field_text(dialect, f)).collect();
    let groups: Vec<SqlFragment> = patterns
        .into_iter()
        .map(|pattern| {
            let per_field: Vec<SqlFragment> =
                exprs.iter().map(|expr| like(expr, pattern.clone())).collect();
            wrap_if_many(per_field, " OR ")
        })
        .collect();
    wrap_if_many(groups, operator.sql())
}

fn compile_bool(query: &BoolQuery, dialect: &dyn SqlDialect) -> Result<SqlFragment> {
    let mut groups = Vec::with_capacity(4);

    for clauses in [&query.must, &query.filter] {
        let parts = compile_all(clauses, dialect)?;
        let joined = SqlFragment::join(parts, " AND ");
        if !joined.is_empty() {
            groups.push(joined.parenthesized());
        }
    }

    // An empty member fragment matches every document: it excludes
    // everything under must_not and satisfies the whole should group.
    if !query.must_not.is_empty() {
        let parts = compile_all(&query.must_not, dialect)?;
        if parts.iter().any(SqlFragment::is_empty) {
            groups.push(SqlFragment::never());
        } else {
            groups.push(SqlFragment::join(parts, " OR ").negated());
        }
    }

    if !query.should.is_empty() {
        let threshold = resolve_minimum_should_match(
            query.minimum_should_match.as_deref(),
            query.should.len(),
        )?;
        if threshold != 1 {
            return Err(SearchError::UnsupportedThreshold { n: threshold });
        }
        let parts = compile_all(&query.should, dialect)?;
        if !parts.iter().any(SqlFragment::is_empty) {
            groups.push(SqlFragment::join(parts, " OR ").parenthesized());
        }
    }

    Ok(SqlFragment::join(groups, " AND "))
}

fn compile_all(clauses: &[Predicate], dialect: &dyn SqlDialect) -> Result<Vec<SqlFragment>> {
    clauses.iter().map(|c| compile(c, dialect)).collect()
}

fn like(expr: &str, pattern: String) -> SqlFragment {
    SqlFragment::bound(format!("{expr} LIKE ? ESCAPE '\\'"), vec![pattern.into()])
}

fn wrap_if_many(parts: Vec<SqlFragment>, separator: &str) -> SqlFragment {
    let many = parts.len() > 1;
    let joined = SqlFragment::join(parts, separator);
    if many {
        joined.parenthesized()
    } else {
        joined
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
