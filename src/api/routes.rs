//! API route definitions.

use super::state::AppState;
use crate::detect::{Detector, Sensitivity, Severity};
use crate::record::TimeRange;
use crate::sources::DataSourceRef;
use crate::storage::{job_state_counts, PersistenceError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path as FsPath;
use tracing::{error, warn};
use uuid::Uuid;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/anomalies", get(job_anomalies))
        .route("/jobs/{id}/cancel", post(cancel_job))
}

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<PersistenceError> for ApiError {
    fn from(e: PersistenceError) -> Self {
        error!(error = %e, "storage error");
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": { "message": message } }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id '{}'", raw)))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let jobs: Value = match job_state_counts(state.store.pool()) {
        Ok(counts) => counts
            .into_iter()
            .map(|(s, n)| (s.as_str().to_string(), json!(n)))
            .collect::<serde_json::Map<_, _>>()
            .into(),
        Err(e) => {
            error!(error = %e, "health check could not read job counts");
            Value::Null
        }
    };
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "jobs": jobs
        },
        "meta": meta()
    }))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_jobs(State(state): State<AppState>, Query(params): Query<ListParams>) -> Result<Json<Value>, ApiError> {
    let stored = state.store.list_jobs(params.limit.unwrap_or(50).min(500))?;
    let active: Vec<Value> = state
        .queue
        .list()
        .await
        .into_iter()
        .filter(|(_, s)| !s.is_terminal())
        .map(|(id, s)| json!({ "id": id, "state": s }))
        .collect();
    Ok(Json(json!({
        "data": stored,
        "meta": { "total": stored.len(), "active": active }
    })))
}

#[derive(Deserialize)]
struct SubmitRequest {
    source: DataSourceRef,
    #[serde(default)]
    time_range: Option<TimeRange>,
    #[serde(default)]
    sensitivity: Option<Sensitivity>,
    #[serde(default)]
    detectors: Option<Vec<Detector>>,
    #[serde(default)]
    llm_batch_size: Option<usize>,
}

/// File sources must resolve to a path under the configured data root.
fn confine_file_source(source: &mut DataSourceRef, data_root: Option<&FsPath>) -> Result<(), ApiError> {
    if source.kind != "jsonl" {
        return Ok(());
    }
    let Some(root) = data_root else {
        return Err(ApiError::BadRequest(
            "file sources are not accepted over HTTP; set server.data_root to enable them".to_string(),
        ));
    };
    let root = root.canonicalize().map_err(|e| {
        error!(root = %root.display(), error = %e, "data root is not readable");
        ApiError::Internal("data root is not readable".to_string())
    })?;
    let path = root
        .join(&source.location)
        .canonicalize()
        .map_err(|_| ApiError::BadRequest(format!("source file '{}' not found under the data root", source.location)))?;
    if !path.starts_with(&root) {
        warn!(location = %source.location, "rejected source outside the data root");
        return Err(ApiError::BadRequest(format!(
            "source file '{}' is outside the data root",
            source.location
        )));
    }
    source.location = path.to_string_lossy().into_owned();
    Ok(())
}

async fn submit_job(State(state): State<AppState>, Json(mut req): Json<SubmitRequest>) -> Result<(StatusCode, Json<Value>), ApiError> {
    confine_file_source(&mut req.source, state.data_root.as_deref())?;
    let mut config = (*state.template).clone();
    if let Some(s) = req.sensitivity {
        config.sensitivity = s;
    }
    if let Some(d) = req.detectors {
        config.detectors = d.into_iter().collect();
    }
    if let Some(b) = req.llm_batch_size {
        config.llm_batch_size = b;
    }
    config.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let handle = state.queue.submit(req.source, req.time_range, config).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "id": handle.id(), "state": handle.state() }, "meta": meta() })),
    ))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    if let Some(handle) = state.queue.get(id).await {
        let live = handle.state();
        if !live.is_terminal() {
            return Ok(Json(json!({ "data": { "id": id, "state": live }, "meta": meta() })));
        }
    }
    match state.store.load_job(id)? {
        Some(job) => Ok(Json(json!({ "data": job, "meta": meta() }))),
        None => Err(ApiError::NotFound(format!("job {} not found", id))),
    }
}

#[derive(Deserialize)]
struct AnomalyParams {
    severity: Option<String>,
}

async fn job_anomalies(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AnomalyParams>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let severity = params
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    if state.store.load_job(id)?.is_none() {
        return Err(ApiError::NotFound(format!("job {} not found", id)));
    }
    let anomalies = state.store.query_anomalies(id, severity)?;
    Ok(Json(json!({
        "data": anomalies,
        "meta": { "total": anomalies.len(), "severity": severity }
    })))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = parse_id(&id)?;
    if !state.queue.cancel(id).await {
        return Err(ApiError::NotFound(format!("job {} is not known to this server", id)));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "id": id, "cancel_requested": true }, "meta": meta() })),
    ))
}
