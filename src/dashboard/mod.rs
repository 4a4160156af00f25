//! HTTP adapter over the job coordinator and the live file routing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ProtocolError, ResourceError};
use crate::model::{DirectoryManifest, JobRequest};
use crate::node::Node;
use crate::server::{AgentFileResource, AgentResourceUri, ByteRange, KillOutcome};

#[derive(Clone)]
pub struct DashboardState {
    pub node: Arc<Node>,
}

impl DashboardState {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    name: String,
    user: String,
    status: String,
    status_message: String,
    archive_status: String,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct KillJobResponse {
    job_id: String,
    outcome: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/resolve", post(resolve_job_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .route("/api/jobs/:id/kill", post(kill_job_handler))
        .route("/api/jobs/:id/manifest", get(manifest_handler))
        .route("/api/jobs/:id/files/*path", get(file_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the dashboard until `shutdown` is cancelled.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let app = router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn protocol_status(error: &ProtocolError) -> StatusCode {
    match error {
        ProtocolError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ProtocolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ProtocolError::IdAlreadyExists(_) => StatusCode::CONFLICT,
        ProtocolError::Resolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ProtocolError::StoreFull | ProtocolError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .node
        .server()
        .coordinator()
        .store()
        .list_jobs()
        .await
        .into_iter()
        .map(|job| JobResponse {
            name: job.request.metadata.name.clone(),
            user: job.request.metadata.user.clone(),
            status: job.status.to_string(),
            status_message: job.status_message,
            archive_status: job.archive_status.to_string(),
            claimed_by: job.claimed_by.map(|agent| agent.hostname),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            id: job.id,
        })
        .collect();

    Json(jobs)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<JobRequest>,
) -> impl IntoResponse {
    match state.node.submit_job(payload).await {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => (
            protocol_status(&e),
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn resolve_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<JobRequest>,
) -> Response {
    match state.node.server().coordinator().resolve_dry_run(&payload).await {
        Ok(specification) => Json(specification).into_response(),
        Err(e) => error_response(protocol_status(&e), e),
    }
}

async fn job_status_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.node.server().coordinator().store().get_job(&job_id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(protocol_status(&e), e),
    }
}

async fn kill_job_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.node.kill_job(&job_id, "Killed through the HTTP API").await {
        Ok(outcome) => {
            let outcome = match outcome {
                KillOutcome::AlreadyFinished => "already_finished",
                KillOutcome::KilledBeforeStart => "killed_before_start",
                KillOutcome::AgentNotified => "agent_notified",
            };
            (StatusCode::ACCEPTED, Json(KillJobResponse { job_id, outcome })).into_response()
        }
        Err(e) => error_response(protocol_status(&e), e),
    }
}

/// Latest manifest from whichever server node the agent streams to.
fn find_manifest(node: &Node, job_id: &str) -> Option<Arc<DirectoryManifest>> {
    std::iter::once(node.server())
        .chain(node.peers())
        .find_map(|server| server.files().manifest(job_id))
}

async fn manifest_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<String>,
) -> Response {
    match find_manifest(&state.node, &job_id) {
        Some(manifest) => Json(manifest.as_ref().clone()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no live agent for job {}", job_id)),
    }
}

async fn file_handler(
    State(state): State<DashboardState>,
    Path((job_id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let range = match headers.get(header::RANGE).map(|value| value.to_str()) {
        None => None,
        Some(Ok(value)) => match ByteRange::parse(value) {
            Ok(range) => Some(range),
            Err(e) => return error_response(StatusCode::RANGE_NOT_SATISFIABLE, e),
        },
        Some(Err(_)) => {
            return error_response(StatusCode::RANGE_NOT_SATISFIABLE, "unreadable Range header")
        }
    };

    let uri = match AgentResourceUri::new(job_id, &path) {
        Ok(uri) => uri,
        Err(e) => return resource_error_response(e),
    };
    let resource = match state
        .node
        .server()
        .fetch(&uri.job_id, &uri.relative_path, range)
        .await
    {
        Ok(resource) => resource,
        Err(e) => return resource_error_response(e),
    };

    match resource {
        AgentFileResource::Absent => error_response(StatusCode::NOT_FOUND, "resource does not exist"),
        AgentFileResource::Directory(entry) => Json(entry).into_response(),
        AgentFileResource::File(file) => {
            let length = file.end - file.start;
            let mut builder = Response::builder()
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, length)
                .header(header::CONTENT_TYPE, "application/octet-stream");
            builder = if file.partial {
                builder.status(StatusCode::PARTIAL_CONTENT).header(
                    header::CONTENT_RANGE,
                    format!(
                        "bytes {}-{}/{}",
                        file.start,
                        file.end.saturating_sub(1),
                        file.entry.size
                    ),
                )
            } else {
                builder.status(StatusCode::OK)
            };
            match builder.body(Body::from_stream(file.content)) {
                Ok(response) => response,
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
            }
        }
    }
}

fn resource_error_response(error: ResourceError) -> Response {
    match error {
        ResourceError::RangeNotSatisfiable { size } => {
            let mut response = error_response(StatusCode::RANGE_NOT_SATISFIABLE, &error);
            if let Ok(value) = format!("bytes */{}", size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        }
        ResourceError::MalformedRange(_) | ResourceError::MultipleRanges(_) => {
            error_response(StatusCode::RANGE_NOT_SATISFIABLE, error)
        }
        ResourceError::PathOutsideJobDirectory(_) => error_response(StatusCode::NOT_FOUND, error),
        ResourceError::TooManyTransfers => error_response(StatusCode::SERVICE_UNAVAILABLE, error),
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, error),
    }
}
