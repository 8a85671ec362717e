//! HTTP API server.
//!
//! Exposes the record-management core over JSON HTTP: bulk ingestion,
//! search, streaming NDJSON export, and labeling-rule CRUD/metrics.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/datasets/{task}/{name}/bulk` | Ingest a batch of records |
//! | `POST` | `/api/datasets/{task}/{name}/search` | Paged search with optional aggregations |
//! | `POST` | `/api/datasets/{task}/{name}/data` | Stream matching records as NDJSON |
//! | `GET` | `/api/datasets/{task}/{name}/labeling/rules` | List labeling rules |
//! | `POST` | `/api/datasets/{task}/{name}/labeling/rules` | Create a labeling rule |
//! | `GET` | `/api/datasets/{task}/{name}/labeling/rules/metrics` | Aggregate metrics over all rules |
//! | `GET` | `/api/datasets/{task}/{name}/labeling/rules/{*query}` | Fetch a rule, or its metrics with a `/metrics` suffix |
//! | `PATCH` | `/api/datasets/{task}/{name}/labeling/rules/{*query}` | Update a rule's labels/description |
//! | `DELETE` | `/api/datasets/{task}/{name}/labeling/rules/{*query}` | Delete a rule |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! The rule-query path segment is matched as a wildcard: callers
//! percent-encode it, and embedded `/` characters are accepted inside the
//! decoded segment.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "dataset `default/x` not found" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `validation` (422, with a `details` array of offending records),
//! `internal` (500). A failure in the middle of an export cannot change the
//! already-sent status line; the body stream is aborted instead so consumers
//! can tell a fault from a clean end-of-stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

use annotation_harness_core::error::{Error as CoreError, InvalidRecord};
use annotation_harness_core::export::{ndjson_frame, RecordScan};
use annotation_harness_core::index::{RecordIndex, SortField};
use annotation_harness_core::ingest::{self, IngestRequest};
use annotation_harness_core::models::{
    BulkResult, Dataset, DatasetId, LabelingRule, Record, SearchAggregations, TaskType,
};
use annotation_harness_core::query::RecordQuery;
use annotation_harness_core::rules::{self, NewRule};
use annotation_harness_core::search::{self, SearchRequest};
use annotation_harness_core::validate::{RecordValidator, SchemaValidator};

use crate::config::Config;
use crate::db;
use crate::sqlite_index::SqliteIndex;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub index: Arc<dyn RecordIndex>,
    pub validator: Arc<dyn RecordValidator>,
    /// Workspace assumed when a request carries no `workspace` parameter.
    pub default_workspace: String,
    /// Records per internal export batch.
    pub export_chunk_size: usize,
}

/// Starts the HTTP server against the configured SQLite index.
///
/// Binds to `[server].bind` and runs until the process is terminated. The
/// database must have been initialized with `anno init` first.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let state = AppState {
        index: Arc::new(SqliteIndex::new(pool)),
        validator: Arc::new(SchemaValidator),
        default_workspace: config.datasets.default_workspace.clone(),
        export_chunk_size: config.export.chunk_size,
    };

    let app = build_router(state);

    let bind_addr = &config.server.bind;
    info!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router. Separated from [`run_server`] so tests can drive the
/// API against an in-memory index.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/datasets/{task}/{name}/bulk", post(handle_bulk))
        .route("/api/datasets/{task}/{name}/search", post(handle_search))
        .route("/api/datasets/{task}/{name}/data", post(handle_stream_data))
        .route(
            "/api/datasets/{task}/{name}/labeling/rules",
            get(handle_list_rules).post(handle_create_rule),
        )
        .route(
            "/api/datasets/{task}/{name}/labeling/rules/metrics",
            get(handle_dataset_rules_metrics),
        )
        .route(
            "/api/datasets/{task}/{name}/labeling/rules/{*query}",
            get(handle_get_rule_or_metrics)
                .patch(handle_update_rule)
                .delete(handle_delete_rule),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"not_found"`, `"conflict"`).
    code: String,
    /// Human-readable error message.
    message: String,
    /// Offending records, present on validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<InvalidRecord>>,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<Vec<InvalidRecord>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        details: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
        details: None,
    }
}

/// Maps core errors onto the HTTP taxonomy. Collaborator errors surface as
/// 500s; everything the caller can fix maps to a 4xx.
fn classify(err: CoreError) -> AppError {
    match err {
        CoreError::DatasetNotFound(_) | CoreError::RuleNotFound(_) => not_found(err.to_string()),
        CoreError::RuleConflict(_) => AppError {
            status: StatusCode::CONFLICT,
            code: "conflict".to_string(),
            message: err.to_string(),
            details: None,
        },
        CoreError::Validation { records, .. } => {
            let message = format!("validation failed for {} record(s)", records.len());
            AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "validation".to_string(),
                message,
                details: Some(records),
            }
        }
        CoreError::InvalidPagination(_) | CoreError::InvalidSort(_) => {
            bad_request(err.to_string())
        }
        CoreError::Index(index_err) => {
            error!("index error: {}", index_err);
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: index_err.to_string(),
                details: None,
            }
        }
    }
}

// ============ Common request plumbing ============

/// Query parameters shared by every dataset-scoped endpoint.
#[derive(Deserialize)]
struct CommonParams {
    workspace: Option<String>,
}

fn parse_task(task: &str) -> Result<TaskType, AppError> {
    TaskType::parse(task)
        .ok_or_else(|| bad_request(format!("unknown task `{}`", task)))
}

fn dataset_identity(
    state: &AppState,
    task: &str,
    name: &str,
    params: &CommonParams,
) -> Result<DatasetId, AppError> {
    let task = parse_task(task)?;
    let workspace = params
        .workspace
        .clone()
        .unwrap_or_else(|| state.default_workspace.clone());
    Ok(DatasetId::new(workspace, name, task))
}

async fn resolve_dataset(state: &AppState, id: &DatasetId) -> Result<Dataset, AppError> {
    state
        .index
        .find_dataset(id)
        .await
        .map_err(|e| classify(e.into()))?
        .ok_or_else(|| not_found(format!("dataset `{}` not found", id)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/datasets/{task}/{name}/bulk ============

#[derive(Deserialize)]
struct BulkRequestBody {
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    records: Vec<Record>,
}

async fn handle_bulk(
    State(state): State<AppState>,
    Path((task, name)): Path<(String, String)>,
    Query(params): Query<CommonParams>,
    Json(body): Json<BulkRequestBody>,
) -> Result<Json<BulkResult>, AppError> {
    let id = dataset_identity(&state, &task, &name, &params)?;
    debug!(
        "bulk request: dataset={}, records={}",
        id,
        body.records.len()
    );

    let result = ingest::ingest(
        state.index.as_ref(),
        state.validator.as_ref(),
        IngestRequest {
            workspace: id.workspace,
            name: id.name,
            task: id.task,
            tags: body.tags,
            metadata: body.metadata,
            created_by: None,
            records: body.records,
        },
    )
    .await
    .map_err(classify)?;

    info!(
        "bulk ingested dataset={}: processed={}, failed={}",
        result.dataset, result.processed, result.failed
    );
    Ok(Json(result))
}

// ============ POST /api/datasets/{task}/{name}/search ============

#[derive(Deserialize)]
struct SearchParams {
    workspace: Option<String>,
    #[serde(default)]
    from: i64,
    #[serde(default = "default_search_limit")]
    limit: i64,
    #[serde(default)]
    include_metrics: bool,
}

fn default_search_limit() -> i64 {
    50
}

#[derive(Deserialize, Default)]
struct SearchBody {
    query: Option<RecordQuery>,
    #[serde(default)]
    sort: Vec<SortField>,
}

#[derive(Serialize)]
struct SearchResults {
    total: u64,
    records: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregations: Option<SearchAggregations>,
}

async fn handle_search(
    State(state): State<AppState>,
    Path((task, name)): Path<(String, String)>,
    Query(params): Query<SearchParams>,
    body: Option<Json<SearchBody>>,
) -> Result<Json<SearchResults>, AppError> {
    let common = CommonParams {
        workspace: params.workspace.clone(),
    };
    let id = dataset_identity(&state, &task, &name, &common)?;
    resolve_dataset(&state, &id).await?;

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let page = search::search(
        state.index.as_ref(),
        &id,
        SearchRequest {
            query: body.query,
            sort: body.sort,
            from: params.from,
            limit: params.limit,
            include_metrics: params.include_metrics,
        },
    )
    .await
    .map_err(classify)?;

    Ok(Json(SearchResults {
        total: page.total,
        records: page.records,
        aggregations: page.metrics,
    }))
}

// ============ POST /api/datasets/{task}/{name}/data ============

#[derive(Deserialize)]
struct StreamParams {
    workspace: Option<String>,
    id_from: Option<String>,
    limit: Option<i64>,
}

/// Holds the scan for the lifetime of the response body. If the client
/// disconnects mid-stream the body is dropped, and the guard hands the
/// outstanding cursor back to the index — cursors are a bounded resource
/// and must not outlive their export.
struct GuardedScan {
    scan: RecordScan,
    index: Arc<dyn RecordIndex>,
}

impl Drop for GuardedScan {
    fn drop(&mut self) {
        if let Some(cursor) = self.scan.take_cursor() {
            let index = self.index.clone();
            tokio::spawn(async move {
                if let Err(err) = index.release_scan(&cursor).await {
                    debug!("failed to release scan cursor: {}", err);
                }
            });
        }
    }
}

async fn handle_stream_data(
    State(state): State<AppState>,
    Path((task, name)): Path<(String, String)>,
    Query(params): Query<StreamParams>,
    body: Option<Json<RecordQuery>>,
) -> Result<Response, AppError> {
    let common = CommonParams {
        workspace: params.workspace.clone(),
    };
    let id = dataset_identity(&state, &task, &name, &common)?;
    resolve_dataset(&state, &id).await?;

    let limit = match params.limit {
        Some(limit) if limit <= 0 => {
            return Err(bad_request(format!("limit must be > 0, got {}", limit)))
        }
        Some(limit) => Some(limit as u64),
        None => None,
    };
    let query = body.map(|Json(q)| q).unwrap_or_default();

    let scan = RecordScan::new(
        state.index.clone(),
        id,
        query,
        params.id_from,
        limit,
        state.export_chunk_size,
    );

    // One record per self-terminated JSON line, no enclosing array. A scan
    // failure after transmission has begun aborts the body so the client
    // sees a truncated stream, never a clean close.
    let stream = futures::stream::unfold(
        GuardedScan {
            scan,
            index: state.index.clone(),
        },
        |mut guarded| async move {
            match guarded.scan.next_batch().await {
                Ok(Some(batch)) => match ndjson_frame(&batch) {
                    Ok(frame) => Some((Ok(Bytes::from(frame)), guarded)),
                    Err(err) => Some((Err(err), guarded)),
                },
                Ok(None) => None,
                Err(err) => {
                    error!("export scan failed mid-stream: {}", err);
                    Some((Err(err), guarded))
                }
            }
        },
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .map_err(|err| {
            error!("failed to build export response: {}", err);
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: err.to_string(),
                details: None,
            }
        })?;
    Ok(response)
}

// ============ Labeling rules ============

#[derive(Deserialize)]
struct CreateRuleBody {
    query: String,
    #[serde(default)]
    labels: Vec<String>,
    description: Option<String>,
    author: Option<String>,
}

#[derive(Deserialize)]
struct UpdateRuleBody {
    labels: Option<Vec<String>>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct RuleMetricsParams {
    workspace: Option<String>,
    /// Comma-separated target labels overriding the stored rule's.
    labels: Option<String>,
}

async fn handle_list_rules(
    State(state): State<AppState>,
    Path((task, name)): Path<(String, String)>,
    Query(params): Query<CommonParams>,
) -> Result<Json<Vec<LabelingRule>>, AppError> {
    let id = dataset_identity(&state, &task, &name, &params)?;
    let dataset = resolve_dataset(&state, &id).await?;
    let rules = rules::list_rules(state.index.as_ref(), &dataset)
        .await
        .map_err(classify)?;
    Ok(Json(rules))
}

async fn handle_create_rule(
    State(state): State<AppState>,
    Path((task, name)): Path<(String, String)>,
    Query(params): Query<CommonParams>,
    Json(body): Json<CreateRuleBody>,
) -> Result<Json<LabelingRule>, AppError> {
    let id = dataset_identity(&state, &task, &name, &params)?;
    let dataset = resolve_dataset(&state, &id).await?;
    let rule = rules::add_rule(
        state.index.as_ref(),
        &dataset,
        NewRule {
            query: body.query,
            labels: body.labels,
            description: body.description,
            author: body.author,
        },
    )
    .await
    .map_err(classify)?;
    info!("rule created: dataset={}, query={}", id, rule.query);
    Ok(Json(rule))
}

async fn handle_dataset_rules_metrics(
    State(state): State<AppState>,
    Path((task, name)): Path<(String, String)>,
    Query(params): Query<CommonParams>,
) -> Result<Json<annotation_harness_core::models::DatasetRulesMetrics>, AppError> {
    let id = dataset_identity(&state, &task, &name, &params)?;
    let dataset = resolve_dataset(&state, &id).await?;
    let metrics = rules::dataset_rules_metrics(state.index.as_ref(), &dataset)
        .await
        .map_err(classify)?;
    Ok(Json(metrics))
}

/// The wildcard tail is either a bare rule query or `<query>/metrics`. Rule
/// queries may contain `/` (callers percent-encode other delimiters), which
/// is why this cannot be two static routes.
fn split_rule_tail(tail: &str) -> (&str, bool) {
    match tail.strip_suffix("/metrics") {
        Some(query) if !query.is_empty() => (query, true),
        _ => (tail, false),
    }
}

async fn handle_get_rule_or_metrics(
    State(state): State<AppState>,
    Path((task, name, tail)): Path<(String, String, String)>,
    Query(params): Query<RuleMetricsParams>,
) -> Result<Response, AppError> {
    let common = CommonParams {
        workspace: params.workspace.clone(),
    };
    let id = dataset_identity(&state, &task, &name, &common)?;
    let dataset = resolve_dataset(&state, &id).await?;

    let (query, want_metrics) = split_rule_tail(&tail);
    if want_metrics {
        let labels: Option<Vec<String>> = params.labels.as_deref().map(|raw| {
            raw.split(',')
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        });
        let metrics =
            rules::rule_metrics(state.index.as_ref(), &dataset, query, labels.as_deref())
                .await
                .map_err(classify)?;
        Ok(Json(metrics).into_response())
    } else {
        let rule = rules::find_rule(state.index.as_ref(), &dataset, query)
            .await
            .map_err(classify)?;
        Ok(Json(rule).into_response())
    }
}

async fn handle_update_rule(
    State(state): State<AppState>,
    Path((task, name, query)): Path<(String, String, String)>,
    Query(params): Query<CommonParams>,
    Json(body): Json<UpdateRuleBody>,
) -> Result<Json<LabelingRule>, AppError> {
    let id = dataset_identity(&state, &task, &name, &params)?;
    let dataset = resolve_dataset(&state, &id).await?;
    let rule = rules::update_rule(
        state.index.as_ref(),
        &dataset,
        &query,
        body.labels,
        body.description,
    )
    .await
    .map_err(classify)?;
    Ok(Json(rule))
}

async fn handle_delete_rule(
    State(state): State<AppState>,
    Path((task, name, query)): Path<(String, String, String)>,
    Query(params): Query<CommonParams>,
) -> Result<StatusCode, AppError> {
    let id = dataset_identity(&state, &task, &name, &params)?;
    let dataset = resolve_dataset(&state, &id).await?;
    rules::delete_rule(state.index.as_ref(), &dataset, &query)
        .await
        .map_err(classify)?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::split_rule_tail;

    #[test]
    fn rule_tail_splits_metrics_suffix() {
        assert_eq!(split_rule_tail("bad"), ("bad", false));
        assert_eq!(split_rule_tail("bad/metrics"), ("bad", true));
        assert_eq!(split_rule_tail("a/b/metrics"), ("a/b", true));
        assert_eq!(split_rule_tail("metrics"), ("metrics", false));
    }
}
