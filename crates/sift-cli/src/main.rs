//! # sift-cli
//!
//! Command-line front end for SIFT.
//!
//! - `sift compile <body>`: compile a search body locally and print the SQL.
//! - `sift search <index> <body>`: run a search against a hub.
//! - `sift put <index> <type> [id] <doc>`: index one document.
//! - `sift mapping <index> <body>`: declare field types for an index.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sift_core::sql::{dialect_named, SqlDialect};
use sift_core::{query, sort, SearchError, SearchRequestPlan, SqlFragment};
use tabled::{settings::Style, Table, Tabled};

/// SIFT: search DSL documents, compiled to SQL.
#[derive(Parser)]
#[command(name = "sift", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a search body and print the generated SQL.
    Compile {
        /// Search body (JSON); `-` reads stdin.
        body: String,

        /// Target SQL dialect (sqlite, postgres).
        #[arg(long, default_value = "sqlite")]
        dialect: String,

        /// Reject unsupported sort entries instead of skipping them.
        #[arg(long)]
        strict_sort: bool,
    },

    /// Run a search against a SIFT hub.
    Search {
        /// Comma-separated indices; `_all` searches everything.
        index: String,

        /// Search body (JSON); `-` reads stdin.
        #[arg(default_value = "{}")]
        body: String,

        /// Restrict to these document types (comma-separated).
        #[arg(long = "type")]
        doc_type: Option<String>,

        #[arg(long)]
        from: Option<i64>,

        #[arg(long)]
        size: Option<i64>,

        /// Print hits as a table instead of JSON.
        #[arg(long)]
        table: bool,
    },

    /// Index one document.
    Put {
        index: String,
        doc_type: String,
        /// Document JSON, optionally preceded by an explicit id.
        #[arg(num_args = 1..=2, required = true)]
        args: Vec<String>,
    },

    /// Declare field types (`{"properties": {...}}`) for an index.
    Mapping { index: String, body: String },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            body,
            dialect,
            strict_sort,
        } => {
            let Some(dialect) = dialect_named(&dialect) else {
                eprintln!("Unknown dialect: {dialect} (expected sqlite or postgres)");
                std::process::exit(2);
            };
            let body = read_body(&body);
            match render_compile(&body, dialect, strict_sort) {
                Ok(report) => println!("{}", pretty(&report)),
                Err(e) => {
                    eprintln!("[{}] {}", e.kind(), e);
                    std::process::exit(1);
                }
            }
        }

        // Remote commands
        cmd => {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to build tokio runtime: {e}");
                    std::process::exit(1);
                }
            };
            if !rt.block_on(async_main(cmd)) {
                std::process::exit(1);
            }
        }
    }
}

async fn async_main(cmd: Commands) -> bool {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("SIFT_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:9200".to_string());
    let base_url = base_url.trim_end_matches('/');

    match cmd {
        Commands::Search {
            index,
            body,
            doc_type,
            from,
            size,
            table,
        } => {
            let url = search_url(base_url, &index, doc_type.as_deref(), from, size);
            let body = read_body(&body);
            match send_json(client.post(&url).header("content-type", "application/json").body(body))
                .await
            {
                Ok(json) if table => {
                    println!("{}", hits_table(&json));
                    true
                }
                Ok(json) => {
                    println!("{}", pretty(&json));
                    true
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    false
                }
            }
        }

        Commands::Put {
            index,
            doc_type,
            args,
        } => {
            let (id, doc) = match args.as_slice() {
                [id, doc] => (Some(id.as_str()), doc.as_str()),
                [doc] => (None, doc.as_str()),
                _ => return false,
            };
            let doc: Value = match serde_json::from_str(&read_body(doc)) {
                Ok(doc) => doc,
                Err(e) => {
                    eprintln!("Invalid document: {e}");
                    return false;
                }
            };
            let request = match id {
                Some(id) => client.put(format!("{base_url}/{index}/{doc_type}/{id}")),
                None => client.post(format!("{base_url}/{index}/{doc_type}")),
            };
            report(send_json(request.json(&doc)).await)
        }

        Commands::Mapping { index, body } => {
            let body: Value = match serde_json::from_str(&read_body(&body)) {
                Ok(body) => body,
                Err(e) => {
                    eprintln!("Invalid mapping: {e}");
                    return false;
                }
            };
            let url = format!("{base_url}/{index}/_mapping");
            report(send_json(client.put(url).json(&body)).await)
        }

        Commands::Compile { .. } => true,
    }
}

// =============================================================================
// Local compilation
// =============================================================================

/// Everything the compiler produces for `body`, as a JSON report.
fn render_compile(
    body: &str,
    dialect: &'static dyn SqlDialect,
    strict_sort: bool,
) -> Result<Value, SearchError> {
    let options = sift_core::PlanOptions {
        strict_sort,
        ..Default::default()
    };
    let plan = SearchRequestPlan::build_with(body, options)?;
    let where_clause = query::compile(plan.predicate(), dialect)?;
    let order_by = sort::compile(plan.sort(), dialect);

    let mut statement = SqlFragment::raw("SELECT id, type, doc FROM <index>");
    if !where_clause.is_empty() {
        statement.push_str(" WHERE ");
        statement.append(where_clause.clone());
    }
    if !order_by.is_empty() {
        statement.push_str(" ");
        statement.push_str(&order_by);
    }
    statement.push_str(&format!(" LIMIT {} OFFSET {}", plan.size(), plan.from()));

    let params: Vec<Value> = where_clause.params().iter().map(|p| p.to_json()).collect();
    Ok(json!({
        "dialect": dialect.name(),
        "where": dialect.finalize(where_clause.sql()),
        "params": params,
        "order_by": order_by,
        "from": plan.from(),
        "size": plan.size(),
        "aggregations": plan.aggregations().to_json(),
        "sql": statement.to_inline_sql(),
        "fingerprint": plan.fingerprint(),
    }))
}

// =============================================================================
// Remote helpers
// =============================================================================

fn search_url(
    base: &str,
    index: &str,
    doc_type: Option<&str>,
    from: Option<i64>,
    size: Option<i64>,
) -> String {
    let mut url = match doc_type {
        Some(t) => format!("{base}/{index}/{t}/_search"),
        None => format!("{base}/{index}/_search"),
    };
    let mut params = vec![];
    if let Some(from) = from {
        params.push(format!("from={from}"));
    }
    if let Some(size) = size {
        params.push(format!("size={size}"));
    }
    if !params.is_empty() {
        url.push('?');
        url.push_str(&params.join("&"));
    }
    url
}

/// Send and decode a JSON response; non-2xx statuses surface the hub's
/// `error.reason`.
async fn send_json(request: reqwest::RequestBuilder) -> Result<Value, String> {
    let resp = request.send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    let json: Value = resp.json().await.map_err(|e| e.to_string())?;
    if status.is_success() {
        Ok(json)
    } else {
        let reason = json["error"]["reason"].as_str().unwrap_or("request failed");
        Err(format!("{status}: {reason}"))
    }
}

fn report(outcome: Result<Value, String>) -> bool {
    match outcome {
        Ok(json) => {
            println!("{}", pretty(&json));
            true
        }
        Err(e) => {
            eprintln!("Error: {e}");
            false
        }
    }
}

#[derive(Tabled)]
struct HitRow {
    #[tabled(rename = "_index")]
    index: String,
    #[tabled(rename = "_type")]
    doc_type: String,
    #[tabled(rename = "_id")]
    id: String,
    #[tabled(rename = "_source")]
    source: String,
}

fn hits_table(response: &Value) -> String {
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
    let rows: Vec<HitRow> = response["hits"]["hits"]
        .as_array()
        .map(|hits| {
            hits.iter()
                .map(|hit| HitRow {
                    index: text(&hit["_index"]),
                    doc_type: text(&hit["_type"]),
                    id: text(&hit["_id"]),
                    source: hit["_source"].to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let total = response["hits"]["total"].as_u64().unwrap_or(0);
    let mut table = Table::new(rows);
    table.with(Style::modern());
    format!("{table}\n{total} total hit(s)")
}

/// `-` reads the body from stdin.
fn read_body(arg: &str) -> String {
    if arg != "-" {
        return arg.to_string();
    }
    std::io::read_to_string(std::io::stdin()).unwrap_or_default()
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_core::sql::{POSTGRES, SQLITE};

    #[test]
    fn test_compile_term_sqlite() {
        let report =
            render_compile(r#"{"query":{"term":{"user":"kimchy"}},"size":5}"#, &SQLITE, false)
                .unwrap();
        assert_eq!(report["where"], "sift_text(doc -> '$.user') = ?");
        assert_eq!(report["params"], json!(["kimchy"]));
        assert_eq!(
            report["sql"],
            "SELECT id, type, doc FROM <index> WHERE sift_text(doc -> '$.user') = 'kimchy' LIMIT 5 OFFSET 0"
        );
    }

    #[test]
    fn test_compile_postgres_renumbers() {
        let report = render_compile(
            r#"{"query":{"bool":{"must":[{"term":{"a":"x"}},{"term":{"b":"y"}}]}}}"#,
            &POSTGRES,
            false,
        )
        .unwrap();
        assert_eq!(report["dialect"], "postgres");
        assert_eq!(report["where"], "(doc ->> 'a' = $1 AND doc ->> 'b' = $2)");
    }

    #[test]
    fn test_compile_strict_sort() {
        let body = r#"{"sort":[{"n":{"order":"sideways"}}]}"#;
        assert!(render_compile(body, &SQLITE, false).is_ok());
        let err = render_compile(body, &SQLITE, true).unwrap_err();
        assert_eq!(err.kind(), "sort_parse_exception");
    }

    #[test]
    fn test_compile_reports_aggs() {
        let report = render_compile(
            r#"{"aggs":{"total":{"sum":{"field":"n"}}}}"#,
            &SQLITE,
            false,
        )
        .unwrap();
        assert_eq!(report["aggregations"], json!({ "total": { "sum": { "field": "n" } } }));
        assert_eq!(report["sql"], "SELECT id, type, doc FROM <index> LIMIT 10 OFFSET 0");
    }

    #[test]
    fn test_search_url() {
        assert_eq!(
            search_url("http://h", "a,b", None, None, None),
            "http://h/a,b/_search"
        );
        assert_eq!(
            search_url("http://h", "a", Some("t"), Some(5), Some(2)),
            "http://h/a/t/_search?from=5&size=2"
        );
    }

    #[test]
    fn test_hits_table_lists_rows() {
        let out = hits_table(&json!({
            "hits": {
                "total": 1,
                "hits": [{ "_index": "i", "_type": "t", "_id": "7", "_source": { "x": 1 } }]
            }
        }));
        assert!(out.contains("_id"));
        assert!(out.contains("{\"x\":1}"));
        assert!(out.ends_with("1 total hit(s)"));
    }
}
