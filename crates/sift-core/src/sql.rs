//! # SQL Fragments & Dialects
//!
//! Every value that originates in a request travels as a bound parameter.
//! Fragments carry anonymous `?` placeholders and compose by concatenation;
//! the dialect renumbers them when a statement is finalized. Identifiers are
//! drawn from a closed vocabulary (`id`, `type`, `doc`, validated table
//! names) and field names only ever appear as escaped string literals.

use serde::Serialize;
use serde_json::Value;

use crate::aggs::Interval;

/// Name of the JSON document column.
pub const DOC_COLUMN: &str = "doc";

/// A bound SQL parameter (or a scalar read back from a result row).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(*r)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Real(r) => Some(*r as i64),
            Self::Text(s) => s.parse().ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Null => None,
        }
    }

    fn to_literal(&self) -> String {
        match self {
            Self::Null => "NULL".into(),
            Self::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => r.to_string(),
            Self::Text(s) => quote_literal(s),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

// =============================================================================
// Fragments
// =============================================================================

/// A piece of SQL text plus the parameters its `?` placeholders bind, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bound(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A clause that never matches.
    pub fn never() -> Self {
        Self::raw("1 = 0")
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn into_parts(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.params)
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn push_str(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    pub fn append(&mut self, other: SqlFragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    pub fn parenthesized(self) -> Self {
        Self {
            sql: format!("({})", self.sql),
            params: self.params,
        }
    }

    pub fn negated(self) -> Self {
        Self {
            sql: format!("NOT ({})", self.sql),
            params: self.params,
        }
    }

    /// Join non-empty parts with `separator` (e.g. `" AND "`).
    pub fn join(parts: Vec<SqlFragment>, separator: &str) -> Self {
        let mut out = Self::empty();
        for part in parts.into_iter().filter(|p| !p.is_empty()) {
            if !out.is_empty() {
                out.sql.push_str(separator);
            }
            out.append(part);
        }
        out
    }

    /// Render with parameters substituted as literals. For humans only:
    /// explain output and logs, never execution.
    pub fn to_inline_sql(&self) -> String {
        let mut params = self.params.iter();
        rewrite_placeholders(&self.sql, |_| {
            params
                .next()
                .map(SqlValue::to_literal)
                .unwrap_or_else(|| "?".into())
        })
    }
}

/// Replace every `?` outside single-quoted literals with `render(n)` (1-based).
fn rewrite_placeholders(sql: &str, mut render: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut in_literal = false;
    let mut n = 0;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                n += 1;
                out.push_str(&render(n));
            }
            _ => out.push(c),
        }
    }
    out
}

pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Escape `LIKE` metacharacters; pair with `ESCAPE '\'`.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Field names are interpolated as literals, so they must stay printable.
pub fn check_field_name(field: &str) -> Result<(), String> {
    if field.is_empty() {
        return Err("field name must not be empty".into());
    }
    if field.split('.').any(str::is_empty) {
        return Err(format!("field name [{field}] has an empty path segment"));
    }
    if field.chars().any(|c| c == '"' || c.is_control()) {
        return Err(format!("field name [{field}] contains forbidden characters"));
    }
    Ok(())
}

/// SQL expression for a document field; `_id` and `_type` address columns.
pub fn field_expr(dialect: &dyn SqlDialect, field: &str) -> String {
    match field {
        "_id" => "id".into(),
        "_type" => "type".into(),
        _ => dialect.json_text(DOC_COLUMN, field),
    }
}

/// Like [`field_expr`], but always text: the form equality and pattern
/// predicates compare against.
pub fn field_text(dialect: &dyn SqlDialect, field: &str) -> String {
    match field {
        "_id" | "_type" => field_expr(dialect, field),
        _ => dialect.json_scalar_text(DOC_COLUMN, field),
    }
}

fn is_simple_segment(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// Dialects
// =============================================================================

/// How a stored field encodes a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// A formatted timestamp string (`date` mappings).
    Formatted,
    /// Milliseconds since the epoch (`long`/`double` mappings).
    EpochMillis,
}

/// The SQL flavour a statement is rendered for.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Text extraction of `field` from the JSON `column`.
    fn json_text(&self, column: &str, field: &str) -> String;

    /// `field` rendered as text whatever its JSON type: strings unquoted,
    /// numbers and booleans as their JSON spelling, `null` as SQL NULL.
    fn json_scalar_text(&self, column: &str, field: &str) -> String {
        self.json_text(column, field)
    }

    /// Numeric cast of `expr`; non-numeric input must fail at execution.
    fn numeric(&self, expr: &str) -> String;

    /// Epoch-millisecond key of `expr` truncated to `interval`.
    fn bucket_key(&self, expr: &str, source: TimestampSource, interval: Interval) -> String;

    /// Bind a JSON scalar so it compares equal to [`Self::json_scalar_text`] output.
    fn bind_scalar(&self, value: &Value) -> SqlValue;

    /// Rewrite `?` placeholders into the dialect's native form.
    fn finalize(&self, sql: &str) -> String {
        sql.to_string()
    }
}

/// SQLite with the `sift_*` scalar functions registered by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

/// PostgreSQL over a `jsonb` document column.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

pub static SQLITE: Sqlite = Sqlite;
pub static POSTGRES: Postgres = Postgres;

pub fn dialect_named(name: &str) -> Option<&'static dyn SqlDialect> {
    match name.to_ascii_lowercase().as_str() {
        "sqlite" => Some(&SQLITE),
        "postgres" | "postgresql" => Some(&POSTGRES),
        _ => None,
    }
}

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn json_text(&self, column: &str, field: &str) -> String {
        format!("{column} ->> {}", quote_literal(&sqlite_path(field)))
    }

    /// `->>` yields native INTEGER/REAL (and 1/0 for booleans), so go through
    /// the JSON spelling from `->` instead.
    fn json_scalar_text(&self, column: &str, field: &str) -> String {
        format!("sift_text({column} -> {})", quote_literal(&sqlite_path(field)))
    }

    fn numeric(&self, expr: &str) -> String {
        format!("sift_numeric({expr})")
    }

    fn bucket_key(&self, expr: &str, source: TimestampSource, interval: Interval) -> String {
        let millis = match source {
            TimestampSource::Formatted => format!("sift_parse_timestamp({expr})"),
            TimestampSource::EpochMillis => format!("sift_epoch_millis({expr})"),
        };
        format!("sift_date_trunc('{}', {millis})", interval.unit())
    }

    fn bind_scalar(&self, value: &Value) -> SqlValue {
        scalar_text(value)
    }
}

/// `$.a."b c"` style path for SQLite's JSON operators.
fn sqlite_path(field: &str) -> String {
    let mut path = String::from("$");
    for segment in field.split('.') {
        path.push('.');
        if is_simple_segment(segment) {
            path.push_str(segment);
        } else {
            path.push('"');
            path.push_str(segment);
            path.push('"');
        }
    }
    path
}

fn scalar_text(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn json_text(&self, column: &str, field: &str) -> String {
        if !field.contains('.') {
            return format!("{column} ->> {}", quote_literal(field));
        }
        let segments: Vec<String> = field
            .split('.')
            .map(|s| {
                if is_simple_segment(s) {
                    s.to_string()
                } else {
                    format!("\"{s}\"")
                }
            })
            .collect();
        format!(
            "{column} #>> {}",
            quote_literal(&format!("{{{}}}", segments.join(",")))
        )
    }

    fn numeric(&self, expr: &str) -> String {
        format!("({expr})::numeric")
    }

    fn bucket_key(&self, expr: &str, source: TimestampSource, interval: Interval) -> String {
        let ts = match source {
            TimestampSource::Formatted => format!("({expr})::timestamptz AT TIME ZONE 'UTC'"),
            TimestampSource::EpochMillis => {
                format!("to_timestamp(({expr})::bigint / 1000.0) AT TIME ZONE 'UTC'")
            }
        };
        format!(
            "(EXTRACT(EPOCH FROM date_trunc('{}', {ts})) * 1000)::bigint",
            interval.unit()
        )
    }

    fn bind_scalar(&self, value: &Value) -> SqlValue {
        scalar_text(value)
    }

    fn finalize(&self, sql: &str) -> String {
        rewrite_placeholders(sql, |n| format!("${n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_skips_empty_parts() {
        let joined = SqlFragment::join(
            vec![
                SqlFragment::bound("a = ?", vec!["x".into()]),
                SqlFragment::empty(),
                SqlFragment::bound("b = ?", vec!["y".into()]),
            ],
            " AND ",
        );
        assert_eq!(joined.sql(), "a = ? AND b = ?");
        assert_eq!(joined.params(), &[SqlValue::from("x"), SqlValue::from("y")]);
    }

    #[test]
    fn test_inline_sql_escapes_quotes() {
        let frag = SqlFragment::bound("name = ?", vec!["o'brien".into()]);
        assert_eq!(frag.to_inline_sql(), "name = 'o''brien'");
    }

    #[test]
    fn test_question_mark_inside_literal_is_not_a_placeholder() {
        let frag = SqlFragment::bound("doc ->> '$.\"why?\"' = ?", vec!["x".into()]);
        assert_eq!(frag.to_inline_sql(), "doc ->> '$.\"why?\"' = 'x'");
        assert_eq!(POSTGRES.finalize(frag.sql()), "doc ->> '$.\"why?\"' = $1");
    }

    #[test]
    fn test_postgres_numbers_placeholders() {
        assert_eq!(
            POSTGRES.finalize("a = ? AND b IN (?, ?)"),
            "a = $1 AND b IN ($2, $3)"
        );
        assert_eq!(SQLITE.finalize("a = ?"), "a = ?");
    }

    #[test]
    fn test_field_extraction_per_dialect() {
        assert_eq!(SQLITE.json_text("doc", "user"), "doc ->> '$.user'");
        assert_eq!(SQLITE.json_text("doc", "a.b c"), "doc ->> '$.a.\"b c\"'");
        assert_eq!(POSTGRES.json_text("doc", "user"), "doc ->> 'user'");
        assert_eq!(POSTGRES.json_text("doc", "a.b"), "doc #>> '{a,b}'");
        assert_eq!(POSTGRES.json_text("doc", "o'k"), "doc ->> 'o''k'");
    }

    #[test]
    fn test_reserved_fields_map_to_columns() {
        assert_eq!(field_expr(&SQLITE, "_id"), "id");
        assert_eq!(field_expr(&POSTGRES, "_type"), "type");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn test_bind_scalar_is_text_in_every_dialect() {
        for dialect in [&SQLITE as &dyn SqlDialect, &POSTGRES] {
            assert_eq!(dialect.bind_scalar(&json!(42)), SqlValue::Text("42".into()));
            assert_eq!(dialect.bind_scalar(&json!(true)), SqlValue::Text("true".into()));
            assert_eq!(dialect.bind_scalar(&json!("42")), SqlValue::Text("42".into()));
            assert_eq!(dialect.bind_scalar(&json!(null)), SqlValue::Null);
        }
    }

    #[test]
    fn test_scalar_text_extraction() {
        assert_eq!(field_text(&SQLITE, "age"), "sift_text(doc -> '$.age')");
        assert_eq!(field_text(&SQLITE, "a.b c"), "sift_text(doc -> '$.a.\"b c\"')");
        assert_eq!(field_text(&POSTGRES, "age"), "doc ->> 'age'");
        assert_eq!(field_text(&SQLITE, "_id"), "id");
    }

    #[test]
    fn test_bucket_key_expressions() {
        let sqlite = SQLITE.bucket_key("x", TimestampSource::EpochMillis, Interval::Day);
        assert_eq!(sqlite, "sift_date_trunc('day', sift_epoch_millis(x))");
        let pg = POSTGRES.bucket_key("x", TimestampSource::Formatted, Interval::Month);
        assert!(pg.starts_with("(EXTRACT(EPOCH FROM date_trunc('month', (x)::timestamptz"));
    }

    #[test]
    fn test_check_field_name() {
        assert!(check_field_name("user.name").is_ok());
        assert!(check_field_name("").is_err());
        assert!(check_field_name("a..b").is_err());
        assert!(check_field_name("bad\"name").is_err());
    }

    #[test]
    fn test_dialect_lookup() {
        assert_eq!(dialect_named("PostgreSQL").map(|d| d.name()), Some("postgres"));
        assert!(dialect_named("oracle").is_none());
    }
}
