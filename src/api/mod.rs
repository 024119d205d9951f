//! HTTP surface: list, log, run and kill jobs of an app.

pub mod attach;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::catalog::Catalog;
use crate::cluster::ClusterClient;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::error::{ControllerError, Result};
use crate::logs::{Encoding, JobLogReader};
use crate::registry;
use crate::scheduler::{JobSummary, NewJob};
use crate::shutdown::wait_for_shutdown;

pub use attach::{accepts, AttachUpgrade, ATTACH_MEDIA_TYPE, ATTACH_PROTOCOL};

pub const SSE_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn Catalog>,
    pub cluster: Arc<dyn ClusterClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub log_reader: Arc<JobLogReader>,
}

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    tail: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/apps/:app_id/jobs", get(list_jobs_handler).post(run_job_handler))
        .route("/apps/:app_id/jobs/:job_id", delete(kill_job_handler))
        .route("/apps/:app_id/jobs/:job_id/log", get(job_log_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        e
    })?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "API server failed");
            e
        })
}

async fn list_jobs_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<Vec<JobSummary>>> {
    let app = state.catalog.app(&app_id).await?;
    let jobs = registry::list_jobs(state.cluster.as_ref(), &app.id).await?;
    Ok(Json(jobs))
}

async fn job_log_handler(
    State(state): State<AppState>,
    Path((app_id, job_id)): Path<(String, String)>,
    Query(params): Query<LogParams>,
    headers: HeaderMap,
) -> Result<Response> {
    state.catalog.app(&app_id).await?;

    let tail = params.tail.is_some_and(|t| !t.is_empty());
    let (encoding, content_type) = if accepts(&headers, "text/event-stream") {
        (Encoding::ServerSentEvents, SSE_CONTENT_TYPE)
    } else {
        (Encoding::Raw, RAW_CONTENT_TYPE)
    };

    let log = state.log_reader.open(&job_id, tail).await?;

    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(ReaderStream::new(log.into_body(encoding))),
    )
        .into_response())
}

async fn run_job_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    upgrade: AttachUpgrade,
    Json(new_job): Json<NewJob>,
) -> Result<Response> {
    let interactive = accepts(&headers, ATTACH_MEDIA_TYPE);
    if interactive && !upgrade.is_available() {
        return Err(ControllerError::UpgradeRequired);
    }

    let app = state.catalog.app(&app_id).await?;
    match state.dispatcher.run_job(&app, new_job, interactive).await? {
        Dispatched::Scheduled(summary) => Ok(Json(summary).into_response()),
        Dispatched::Attached(job) => upgrade.switch(job),
    }
}

async fn kill_job_handler(
    State(state): State<AppState>,
    Path((app_id, job_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.catalog.app(&app_id).await?;
    registry::kill_job(state.cluster.as_ref(), &job_id).await?;
    Ok(StatusCode::OK)
}
