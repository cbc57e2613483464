//! Scalar functions registered on every SQLite connection.
//!
//! SQLite casts never fail, so these provide the strict conversions the
//! dialect relies on: a non-numeric value fed to `sift_numeric` is an error,
//! not a silent zero.
//!
//! | function                         | result                                  |
//! |----------------------------------|-----------------------------------------|
//! | `sift_numeric(x)`                | integer or real; error if not a number  |
//! | `sift_epoch_millis(x)`           | integer millis from a number            |
//! | `sift_parse_timestamp(x)`        | integer millis from a date string       |
//! | `sift_date_trunc(unit, millis)`  | millis truncated to the unit, UTC       |
//! | `sift_text(json)`                | JSON scalar as text; `null` is NULL     |

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use sift_core::Interval;

pub(super) fn register(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("sift_numeric", 1, flags, numeric)?;
    conn.create_scalar_function("sift_epoch_millis", 1, flags, epoch_millis)?;
    conn.create_scalar_function("sift_parse_timestamp", 1, flags, parse_timestamp)?;
    conn.create_scalar_function("sift_date_trunc", 2, flags, date_trunc)?;
    conn.create_scalar_function("sift_text", 1, flags, text)?;
    Ok(())
}

fn numeric(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    match ctx.get_raw(0) {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::Integer(i)),
        ValueRef::Real(r) => Ok(Value::Real(r)),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let trimmed = text.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::Integer(i));
            }
            match trimmed.parse::<f64>() {
                Ok(r) if r.is_finite() => Ok(Value::Real(r)),
                _ => Err(user_error(format!(
                    "invalid input syntax for type numeric: \"{text}\""
                ))),
            }
        }
        ValueRef::Blob(_) => Err(user_error("cannot cast a blob to numeric")),
    }
}

fn epoch_millis(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    match numeric(ctx)? {
        Value::Real(r) => Ok(Value::Integer(r.trunc() as i64)),
        other => Ok(other),
    }
}

fn parse_timestamp(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    match ctx.get_raw(0) {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::Integer(i)),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            parse_timestamp_millis(&text)
                .map(Value::Integer)
                .ok_or_else(|| {
                    user_error(format!("invalid input syntax for type timestamp: \"{text}\""))
                })
        }
        _ => Err(user_error("timestamp must be a string")),
    }
}

fn date_trunc(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    let unit: String = ctx.get(0)?;
    let interval =
        Interval::parse(&unit).ok_or_else(|| user_error(format!("unknown date_trunc unit [{unit}]")))?;
    match ctx.get_raw(1) {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(millis) => interval
            .truncate_millis(millis)
            .map(Value::Integer)
            .ok_or_else(|| user_error(format!("timestamp out of range: {millis}"))),
        _ => Err(user_error("date_trunc expects epoch milliseconds")),
    }
}

/// Text form of a `->` result: strings lose their quotes, `true`/`false`
/// and numbers keep their JSON spelling.
fn text(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    match ctx.get_raw(0) {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::Text(i.to_string())),
        ValueRef::Real(r) => Ok(Value::Text(r.to_string())),
        ValueRef::Text(bytes) => {
            let raw = String::from_utf8_lossy(bytes);
            Ok(match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(serde_json::Value::Null) => Value::Null,
                Ok(serde_json::Value::String(s)) => Value::Text(s),
                Ok(other) => Value::Text(other.to_string()),
                Err(_) => Value::Text(raw.into_owned()),
            })
        }
        ValueRef::Blob(_) => Err(user_error("cannot render a blob as text")),
    }
}

/// Parse an RFC 3339 timestamp, a `yyyy-MM-dd[ T]HH:mm:ss[.SSS]` local time
/// read as UTC, a bare date, or a string of epoch milliseconds.
fn parse_timestamp_millis(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(millis) = text.parse::<i64>() {
        return Some(millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn user_error(msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::UserFunctionError(msg.into())
}
