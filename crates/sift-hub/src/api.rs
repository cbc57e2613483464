//! # API Handlers
//!
//! Search-compatible endpoints. Searches run on the blocking pool under the
//! configured request timeout; dropping the request (client gone) or hitting
//! the timeout cancels the aggregation walk, which still cleans up after
//! itself.

use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sift_engine::{
    CancelFlag, DocumentStore, ExecutionError, SearchOptions, SearchResponse, StoreError,
};
use std::sync::Arc;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub reason: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            reason: reason.into(),
        }
    }

    fn internal(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", reason)
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let status = match &err {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            ExecutionError::NoSuchIndex { .. } => StatusCode::NOT_FOUND,
            ExecutionError::TimedOut | ExecutionError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %err, "search failed");
        }
        Self::new(status, err.kind(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidIndexName(_) | StoreError::Json(_) => {
                Self::new(StatusCode::BAD_REQUEST, "illegal_argument_exception", err.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "type": self.kind, "reason": self.reason },
            "status": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

// =============================================================================
// Search
// =============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct SearchParams {
    pub from: Option<i64>,
    pub size: Option<i64>,
}

pub async fn search_all(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
    body: String,
) -> Result<Json<SearchResponse>, ApiError> {
    run_search(state, Vec::new(), Vec::new(), params, body).await
}

pub async fn search_index(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Query(params): Query<SearchParams>,
    body: String,
) -> Result<Json<SearchResponse>, ApiError> {
    run_search(state, split_list(&index), Vec::new(), params, body).await
}

pub async fn search_index_type(
    State(state): State<Arc<AppState>>,
    Path((index, doc_type)): Path<(String, String)>,
    Query(params): Query<SearchParams>,
    body: String,
) -> Result<Json<SearchResponse>, ApiError> {
    run_search(state, split_list(&index), split_list(&doc_type), params, body).await
}

/// Sets the flag when dropped unless disarmed first.
struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancelFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

async fn run_search(
    state: Arc<AppState>,
    indices: Vec<String>,
    types: Vec<String>,
    params: SearchParams,
    body: String,
) -> Result<Json<SearchResponse>, ApiError> {
    let cancel = CancelFlag::new();
    let guard = CancelOnDrop::new(cancel.clone());
    let options = SearchOptions {
        from: params.from,
        size: params.size,
        cancel: cancel.clone(),
    };

    let engine = state.engine.clone();
    let task = tokio::task::spawn_blocking(move || {
        engine.compile_and_run_with(&body, &indices, &types, options)
    });

    let outcome = tokio::time::timeout(state.request_timeout(), task).await;
    guard.disarm();
    match outcome {
        Err(_) => {
            cancel.cancel();
            Err(ExecutionError::TimedOut.into())
        }
        Ok(Err(join_err)) => Err(ApiError::internal(format!("search task failed: {join_err}"))),
        Ok(Ok(result)) => result.map(Json).map_err(ApiError::from),
    }
}

// =============================================================================
// Validate
// =============================================================================

pub async fn validate_query(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let indices = split_list(&index);
    let engine = state.engine.clone();
    let explanations = tokio::task::spawn_blocking(move || {
        indices
            .iter()
            .map(|index| match engine.explain(&body, index) {
                Ok(sql) => json!({ "index": index, "valid": true, "explanation": sql }),
                Err(e) => json!({ "index": index, "valid": false, "error": e.to_string() }),
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| ApiError::internal(format!("validate task failed: {e}")))?;

    let valid = explanations.iter().all(|e| e["valid"] == true);
    Ok(Json(json!({ "valid": valid, "explanations": explanations })))
}

// =============================================================================
// Mappings
// =============================================================================

pub async fn put_mapping(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let target = index.clone();
    tokio::task::spawn_blocking(move || engine.backend().create_index(&target))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;

    let stored = state
        .mappings
        .put_properties(&index, None, &body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "mapper_parsing_exception", e))?;
    tracing::info!(index = %index, fields = stored, "mapping updated");
    Ok(Json(json!({ "acknowledged": true })))
}

pub async fn get_mapping(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> Json<Value> {
    let properties: serde_json::Map<String, Value> = state
        .mappings
        .snapshot(&index)
        .into_iter()
        .map(|(field, t)| (field, json!({ "type": t.name() })))
        .collect();
    Json(json!({ index: { "mappings": { "properties": properties } } }))
}

// =============================================================================
// Documents
// =============================================================================

pub async fn put_document(
    State(state): State<Arc<AppState>>,
    Path((index, doc_type, id)): Path<(String, String, String)>,
    Json(doc): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    store_document(state, index, doc_type, id, doc).await
}

pub async fn create_document(
    State(state): State<Arc<AppState>>,
    Path((index, doc_type)): Path<(String, String)>,
    Json(doc): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    store_document(state, index, doc_type, id, doc).await
}

async fn store_document(
    state: Arc<AppState>,
    index: String,
    doc_type: String,
    id: String,
    doc: Value,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !doc.is_object() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "mapper_parsing_exception",
            "document must be a JSON object",
        ));
    }
    let engine = state.engine.clone();
    let (i, t, d) = (index.clone(), doc_type.clone(), id.clone());
    let outcome = tokio::task::spawn_blocking(move || engine.backend().index_document(&i, &t, &d, &doc))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;

    let status = match outcome {
        sift_engine::IndexOutcome::Created => StatusCode::CREATED,
        sift_engine::IndexOutcome::Updated => StatusCode::OK,
    };
    Ok((
        status,
        Json(json!({
            "_index": index,
            "_type": doc_type,
            "_id": id,
            "result": outcome.as_str(),
        })),
    ))
}

/// `a,b` → `["a", "b"]`; blanks dropped.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use sift_engine::SqliteStore;

    fn state() -> Arc<AppState> {
        let store = SqliteStore::open_in_memory().unwrap();
        Arc::new(AppState::new(store, Config::default()))
    }

    async fn put(state: &Arc<AppState>, index: &str, id: &str, doc: Value) -> StatusCode {
        let (status, _) = put_document(
            State(state.clone()),
            Path((index.to_string(), "doc".to_string(), id.to_string())),
            Json(doc),
        )
        .await
        .unwrap();
        status
    }

    #[tokio::test]
    async fn test_put_then_search() {
        let state = state();
        assert_eq!(put(&state, "tweets", "1", json!({ "user": "kimchy" })).await, StatusCode::CREATED);
        assert_eq!(put(&state, "tweets", "1", json!({ "user": "kimchy" })).await, StatusCode::OK);
        put(&state, "tweets", "2", json!({ "user": "bob" })).await;

        let Json(resp) = search_index(
            State(state.clone()),
            Path("tweets".to_string()),
            Query(SearchParams::default()),
            r#"{"query":{"term":{"user":"kimchy"}}}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(resp.hits.total, 1);
        assert_eq!(resp.hits.hits[0].id, "1");
    }

    #[tokio::test]
    async fn test_query_params_override_paging() {
        let state = state();
        for id in ["1", "2", "3"] {
            put(&state, "nums", id, json!({ "n": id })).await;
        }
        let Json(resp) = search_all(
            State(state.clone()),
            Query(SearchParams {
                from: Some(1),
                size: Some(1),
            }),
            r#"{"sort":["n"],"size":50}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(resp.hits.total, 3);
        assert_eq!(resp.hits.hits.len(), 1);
        assert_eq!(resp.hits.hits[0].id, "2");
    }

    #[tokio::test]
    async fn test_malformed_query_is_bad_request() {
        let state = state();
        let err = search_all(
            State(state),
            Query(SearchParams::default()),
            r#"{"query":{"wildcard":{"a":"b*"}}}"#.to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.kind, "parsing_exception");
    }

    #[tokio::test]
    async fn test_unknown_index_is_not_found() {
        let state = state();
        let err = search_index(
            State(state),
            Path("missing".to_string()),
            Query(SearchParams::default()),
            String::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mapping_enables_histogram() {
        let state = state();
        put(&state, "logs", "1", json!({ "ts": "2024-01-01T05:00:00Z" })).await;
        put(&state, "logs", "2", json!({ "ts": "2024-01-02T05:00:00Z" })).await;
        let body = r#"{"size":0,"aggs":{"d":{"date_histogram":{"field":"ts","interval":"day"}}}}"#;

        let err = search_index(
            State(state.clone()),
            Path("logs".to_string()),
            Query(SearchParams::default()),
            body.to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        put_mapping(
            State(state.clone()),
            Path("logs".to_string()),
            Json(json!({ "properties": { "ts": { "type": "date" } } })),
        )
        .await
        .unwrap();
        let Json(resp) = search_index(
            State(state.clone()),
            Path("logs".to_string()),
            Query(SearchParams::default()),
            body.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(resp.aggregations["d"]["buckets"].as_array().unwrap().len(), 2);

        let Json(mapping) = get_mapping(State(state), Path("logs".to_string())).await;
        assert_eq!(mapping["logs"]["mappings"]["properties"]["ts"]["type"], "date");
    }

    #[tokio::test]
    async fn test_validate_query_explains_sql() {
        let state = state();
        put(&state, "tweets", "1", json!({ "user": "kimchy" })).await;
        let Json(out) = validate_query(
            State(state.clone()),
            Path("tweets,ghosts".to_string()),
            r#"{"query":{"match_phrase":{"msg":"hello world"}}}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(out["valid"], false);
        assert_eq!(out["explanations"][0]["valid"], true);
        assert_eq!(
            out["explanations"][0]["explanation"],
            "SELECT id, type, doc FROM \"sift_idx_tweets\" \
             WHERE sift_text(doc -> '$.msg') LIKE 'hello world' ESCAPE '\\'"
        );
        assert_eq!(out["explanations"][1]["valid"], false);
    }

    #[tokio::test]
    async fn test_create_document_assigns_id() {
        let state = state();
        let (status, Json(body)) = create_document(
            State(state.clone()),
            Path(("notes".to_string(), "note".to_string())),
            Json(json!({ "text": "hi" })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["_id"].as_str().unwrap().len(), 32);

        let err = create_document(
            State(state),
            Path(("notes".to_string(), "note".to_string())),
            Json(json!([1, 2])),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_cancel_on_drop() {
        let flag = CancelFlag::new();
        drop(CancelOnDrop::new(flag.clone()));
        assert!(flag.is_cancelled());

        let flag = CancelFlag::new();
        CancelOnDrop::new(flag.clone()).disarm();
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
