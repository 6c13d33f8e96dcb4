use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};

use crate::record::LogRecord;
use crate::store::{BlobStore, ListFilter, LogStats, LogStore, RecordSummary, StoreError};

/// What the external console is allowed to see: the durable table and the
/// blob store, read-only.
#[derive(Clone)]
pub struct ConsoleState {
    pub db: Arc<LogStore>,
    pub blobs: Arc<BlobStore>,
}

type ApiError = (StatusCode, String);

fn internal(err: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[derive(Serialize)]
struct ListResponse {
    total: u64,
    items: Vec<RecordSummary>,
}

async fn list_requests(
    State(state): State<ConsoleState>,
    Query(filter): Query<ListFilter>,
) -> Result<Json<ListResponse>, ApiError> {
    let db = state.db.clone();
    let (items, total) = tokio::task::spawn_blocking(move || db.list(&filter))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok(Json(ListResponse { total, items }))
}

async fn get_request(
    State(state): State<ConsoleState>,
    Path(id): Path<String>,
) -> Result<Json<LogRecord>, ApiError> {
    let db = state.db.clone();
    let record = tokio::task::spawn_blocking(move || db.get(&id))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    match record {
        Some(record) => Ok(Json(record)),
        None => Err((StatusCode::NOT_FOUND, "no such request".to_string())),
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    since: Option<i64>,
}

async fn get_stats(
    State(state): State<ConsoleState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<LogStats>, ApiError> {
    let db = state.db.clone();
    let stats = tokio::task::spawn_blocking(move || db.stats(q.since))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok(Json(stats))
}

async fn get_blob(
    State(state): State<ConsoleState>,
    Path(blob_ref): Path<String>,
) -> Result<Response, ApiError> {
    let blobs = state.blobs.clone();
    let bytes = tokio::task::spawn_blocking(move || blobs.get(&blob_ref))
        .await
        .map_err(internal)?;
    match bytes {
        Ok(bytes) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response()),
        Err(err @ StoreError::InvalidRef(_)) => Err((StatusCode::BAD_REQUEST, err.to_string())),
        Err(err @ StoreError::NotFound(_)) => Err((StatusCode::NOT_FOUND, err.to_string())),
        Err(err) => Err(internal(err)),
    }
}

pub fn router(state: ConsoleState) -> Router {
    Router::new()
        .route("/api/requests", get(list_requests))
        .route("/api/requests/{id}", get(get_request))
        .route("/api/stats", get(get_stats))
        .route("/api/blobs/{blob_ref}", get(get_blob))
        .with_state(state)
}
