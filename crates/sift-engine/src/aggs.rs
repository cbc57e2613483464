//! # Aggregation Executor
//!
//! Walks the aggregation tree depth-first against the context's query table.
//! Each node returns its result by value; siblings are merged by name.
//!
//! A date histogram without children is one grouped query. With children it
//! materializes the bucketed rows once, then one table per bucket, and runs
//! every child with that bucket's table in scope:
//!
//! ```text
//! A = SELECT <key> AS sift_bucket, id, type, doc FROM <query table>
//! for key in SELECT DISTINCT sift_bucket FROM A:
//!     B = SELECT id, type, doc FROM A WHERE sift_bucket = key
//!     children(B)
//! ```

use serde_json::{json, Map, Value};
use sift_core::aggs::{AggregationNode, DateFormat, Interval, MetricKind, NamedAggregation};
use sift_core::sql::{field_expr, quote_ident};
use sift_core::SqlValue;
use tracing::debug;

use crate::context::{temp_table_name, ExecutionContext, QueryTable};
use crate::error::ExecutionError;

/// Execute the `Root` node and return the `aggregations` object.
pub fn execute(
    root: &AggregationNode,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Map<String, Value>, ExecutionError> {
    ctx.check_cancelled()?;
    execute_children(root.children(), ctx)
}

fn execute_children(
    children: &[NamedAggregation],
    ctx: &mut ExecutionContext<'_>,
) -> Result<Map<String, Value>, ExecutionError> {
    let mut out = Map::with_capacity(children.len());
    for child in children {
        out.insert(child.name.clone(), execute_node(&child.node, ctx)?);
    }
    Ok(out)
}

pub fn execute_node(
    node: &AggregationNode,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Value, ExecutionError> {
    ctx.check_cancelled()?;
    match node {
        AggregationNode::Root { children } => Ok(Value::Object(execute_children(children, ctx)?)),
        AggregationNode::Metric { kind, field } => metric(*kind, field, ctx),
        AggregationNode::DateHistogram {
            field,
            interval,
            format,
            children,
        } => {
            let key = bucket_key_expr(field, *interval, ctx)?;
            let buckets = if children.is_empty() {
                grouped_buckets(&key, format.as_ref(), ctx)?
            } else {
                materialized_buckets(&key, field, *interval, format.as_ref(), children, ctx)?
            };
            Ok(json!({ "buckets": buckets }))
        }
    }
}

fn metric(
    kind: MetricKind,
    field: &str,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Value, ExecutionError> {
    let dialect = ctx.executor().dialect();
    let expr = field_expr(dialect, field);
    let arg = match kind {
        MetricKind::ValueCount => expr,
        _ => dialect.numeric(&expr),
    };
    let qt = ctx.query_table();
    let sql = format!("SELECT {}({arg}) FROM {}", kind.sql_function(), qt.sql());
    let rows = ctx
        .executor()
        .query(&sql, qt.params())
        .map_err(ExecutionError::aggregation)?;

    let scalar = rows
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .unwrap_or(SqlValue::Null);
    let value = match (kind, scalar) {
        (_, SqlValue::Null) => Value::Null,
        (MetricKind::ValueCount, v) => v.to_json(),
        (_, SqlValue::Integer(i)) => json!(i as f64),
        (_, v) => v.to_json(),
    };
    Ok(json!({ "value": value }))
}

/// Epoch-millisecond bucket key for `field`; the cast follows the field's
/// mapped type.
fn bucket_key_expr(
    field: &str,
    interval: Interval,
    ctx: &ExecutionContext<'_>,
) -> Result<String, ExecutionError> {
    let field_type = ctx
        .mappings()
        .field_type(ctx.indices(), ctx.types(), field)
        .ok_or_else(|| ExecutionError::NoSuchFieldMapping {
            field: field.to_string(),
        })?;
    let source = field_type
        .timestamp_source()
        .ok_or_else(|| ExecutionError::UnsupportedFieldType {
            field: field.to_string(),
            field_type,
        })?;
    let dialect = ctx.executor().dialect();
    Ok(dialect.bucket_key(&field_expr(dialect, field), source, interval))
}

fn grouped_buckets(
    key: &str,
    format: Option<&DateFormat>,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Vec<Value>, ExecutionError> {
    let qt = ctx.query_table();
    let sql = format!(
        "SELECT sift_bucket, COUNT(*) FROM (SELECT {key} AS sift_bucket FROM {}) AS b \
         WHERE sift_bucket IS NOT NULL GROUP BY sift_bucket ORDER BY sift_bucket",
        qt.sql()
    );
    let rows = ctx
        .executor()
        .query(&sql, qt.params())
        .map_err(ExecutionError::aggregation)?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let key = row.first()?.as_i64()?;
            let count = row.get(1)?.as_i64()?;
            Some(Value::Object(bucket(key, count, format)))
        })
        .collect())
}

fn materialized_buckets(
    key: &str,
    field: &str,
    interval: Interval,
    format: Option<&DateFormat>,
    children: &[NamedAggregation],
    ctx: &mut ExecutionContext<'_>,
) -> Result<Vec<Value>, ExecutionError> {
    let qt = ctx.query_table().clone();
    let params_text = serde_json::to_string(qt.params()).unwrap_or_default();
    let bucketed = temp_table_name(&[
        ctx.plan().source(),
        qt.sql(),
        &params_text,
        field,
        interval.unit(),
    ]);
    ctx.materialize(
        &bucketed,
        &format!("SELECT {key} AS sift_bucket, id, type, doc FROM {}", qt.sql()),
        qt.params(),
    )
    .map_err(ExecutionError::aggregation)?;

    let bucketed_ident = quote_ident(&bucketed);
    let keys: Vec<i64> = ctx
        .executor()
        .query(
            &format!(
                "SELECT DISTINCT sift_bucket FROM {bucketed_ident} \
                 WHERE sift_bucket IS NOT NULL ORDER BY 1"
            ),
            &[],
        )
        .map_err(ExecutionError::aggregation)?
        .iter()
        .filter_map(|row| row.first().and_then(SqlValue::as_i64))
        .collect();
    debug!(table = %bucketed, buckets = keys.len(), "materialized histogram");

    let mut buckets = Vec::with_capacity(keys.len());
    for key in keys {
        ctx.check_cancelled()?;
        let per_bucket = temp_table_name(&[&bucketed, &key.to_string()]);
        ctx.materialize(
            &per_bucket,
            &format!("SELECT id, type, doc FROM {bucketed_ident} WHERE sift_bucket = ?"),
            &[SqlValue::Integer(key)],
        )
        .map_err(ExecutionError::aggregation)?;

        let count = ctx
            .executor()
            .query(&format!("SELECT COUNT(*) FROM {}", quote_ident(&per_bucket)), &[])
            .map_err(ExecutionError::aggregation)?
            .first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i64)
            .unwrap_or(0);

        let nested = ctx.with_query_table(QueryTable::table(&per_bucket), |ctx| {
            execute_children(children, ctx)
        })?;
        let mut entry = bucket(key, count, format);
        entry.extend(nested);
        buckets.push(Value::Object(entry));
    }
    Ok(buckets)
}

fn bucket(key: i64, count: i64, format: Option<&DateFormat>) -> Map<String, Value> {
    let mut entry = Map::new();
    if let Some(format) = format {
        entry.insert("key_as_string".into(), json!(format.format_millis(key)));
    }
    entry.insert("key".into(), json!(key));
    entry.insert("doc_count".into(), json!(count));
    entry
}
