//! HTTP surface for the gate.
//!
//! Thin handlers over [`Gate`]: admission, completion reports, operator
//! policy updates, session summaries, quarantine review, and the
//! newline-delimited audit stream. Policy outcomes are values, not
//! transport errors — a deny is a `200` with `decision: "deny"` so callers
//! can distinguish "the gate said no" from "the gate is unreachable".

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::info;
use uuid::Uuid;

use crate::gate::pipeline::Gate;
use crate::gate::policy::{PolicyConfig, PolicyError};
use crate::gate::tracker::{CompletionOutcome, TrackerError};
use crate::types::AdmissionRequest;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The admission gate.
    pub gate: Arc<Gate>,
}

/// Error responder for the operator-facing endpoints.
#[derive(Debug)]
enum AppError {
    /// Credential below the required level (403).
    Unauthorized(String),
    /// Request shape or config content rejected (400).
    BadRequest(String),
    /// Unknown resource (404).
    NotFound(String),
    /// Internal failure (500).
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(m) => (StatusCode::FORBIDDEN, m),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Internal(m) => {
                tracing::error!(error = %m, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/admit", post(admit))
        .route("/v1/complete", post(complete))
        .route("/v1/policy", put(update_policy))
        .route("/v1/sessions/{session_id}/summary", get(session_summary))
        .route("/v1/audit/stream", get(audit_stream))
        .route("/v1/quarantine/lift", post(lift_quarantine))
        .with_state(state)
}

/// Bind and serve until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "gate listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C is the only shutdown path; a failed hook means we simply
    // never resolve and the process is killed externally.
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

// ── Handlers ────────────────────────────────────────────────────

/// Liveness plus audit-store reachability.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.gate.audit().store_healthy().await;
    let status = if store_ok { "ok" } else { "degraded" };
    let http_status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        http_status,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Admission request. Always `200`; the decision is in the body.
async fn admit(
    State(state): State<AppState>,
    Json(request): Json<AdmissionRequest>,
) -> impl IntoResponse {
    Json(state.gate.admit(&request))
}

/// Completion report from a caller that left the gate to do work.
#[derive(Debug, Deserialize)]
struct CompletionReport {
    work_id: Uuid,
    actual_work_units: u64,
    outcome: ReportedOutcome,
    summary: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReportedOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
struct CompletionAck {
    acknowledged: bool,
    outcome: &'static str,
}

async fn complete(
    State(state): State<AppState>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<CompletionAck>, AppError> {
    let result = match report.outcome {
        ReportedOutcome::Completed => state.gate.complete(
            report.work_id,
            report.actual_work_units,
            report.summary.as_deref(),
        ),
        ReportedOutcome::Failed => state.gate.fail(
            report.work_id,
            report.summary.as_deref().unwrap_or("reported failed"),
        ),
    };
    match result {
        Ok(CompletionOutcome::Reconciled { .. }) => Ok(Json(CompletionAck {
            acknowledged: true,
            outcome: "reconciled",
        })),
        Ok(CompletionOutcome::Overrun { .. }) => Ok(Json(CompletionAck {
            acknowledged: true,
            outcome: "overrun",
        })),
        Ok(CompletionOutcome::AlreadyTerminal) => Ok(Json(CompletionAck {
            acknowledged: true,
            outcome: "already_terminal",
        })),
        Err(TrackerError::UnknownWork { work_id }) => {
            Err(AppError::NotFound(format!("unknown work item {work_id}")))
        }
    }
}

/// Operator policy update.
#[derive(Debug, Deserialize)]
struct PolicyUpdate {
    config: PolicyConfig,
    updater_token: String,
}

async fn update_policy(
    State(state): State<AppState>,
    Json(update): Json<PolicyUpdate>,
) -> Result<impl IntoResponse, AppError> {
    match state
        .gate
        .update_policy(update.config, &update.updater_token)
    {
        Ok(version) => Ok(Json(json!({ "applied": true, "version": version }))),
        Err(e @ PolicyError::Unauthorized { .. }) => Err(AppError::Unauthorized(e.to_string())),
        Err(e @ PolicyError::InvalidConfig { .. }) => Err(AppError::BadRequest(e.to_string())),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

/// Read-only session summary.
async fn session_summary(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .gate
        .summarize(&session_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("unknown session '{session_id}'")))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    /// Resume after this cursor; `0` replays the full retained history.
    #[serde(default)]
    cursor: i64,
}

/// Newline-delimited JSON audit stream, restartable from a cursor.
async fn audit_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let lines = state
        .gate
        .audit()
        .stream_from(params.cursor)
        .filter_map(|event| serde_json::to_string(&event).ok())
        .map(|line| Ok::<_, Infallible>(format!("{line}\n")));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Operator review path for quarantined sessions.
#[derive(Debug, Deserialize)]
struct QuarantineLift {
    session_id: String,
    token: String,
}

async fn lift_quarantine(
    State(state): State<AppState>,
    Json(lift): Json<QuarantineLift>,
) -> Result<impl IntoResponse, AppError> {
    state
        .gate
        .lift_quarantine(&lift.session_id, &lift.token)
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;
    Ok(Json(json!({ "lifted": true })))
}
