//! HTTP front door: health probe plus endpoints that trigger runs.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use catsync_core::SyncOutcome;
use catsync_storage::PgSnapshotStore;
use catsync_sync::{build_scheduler, Orchestrator, SyncConfig, SyncError};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "catsync-web";

const TOKEN_HEADER: &str = "x-automation-token";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub automation_token: Option<String>,
    pub scheduler_enabled: bool,
    pub schedule_hours: u32,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &SyncConfig) -> Self {
        Self {
            orchestrator,
            automation_token: config.automation_token.clone(),
            scheduler_enabled: config.scheduler_enabled,
            schedule_hours: config.schedule_every_hours,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/run", post(run_handler))
        .route("/run_streams", post(run_streams_handler))
        .route("/run_followers", post(run_followers_handler))
        .route("/run_health_check", post(run_health_check_handler))
        .with_state(Arc::new(state))
}

/// Connects the store, starts the scheduler when enabled, and serves until shutdown.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let store = PgSnapshotStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config, Arc::new(store))?);

    let scheduler = build_scheduler(orchestrator.clone(), &config).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "front door listening");
    axum::serve(listener, app(AppState::new(orchestrator, &config)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;

    if let Some(mut scheduler) = scheduler {
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "status": "error", "error": message.into() }))).into_response()
}

/// `Some(response)` when the request must be rejected.
fn check_token(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Option<Response> {
    let expected = state.automation_token.as_deref()?;
    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(query.token.as_deref());
    if presented == Some(expected) {
        None
    } else {
        warn!("rejected request with missing or wrong automation token");
        Some(error_response(StatusCode::FORBIDDEN, "invalid automation token"))
    }
}

/// Token check first, then the body; an empty body reads as `{}`.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &TokenQuery,
    body: &[u8],
) -> Result<RunRequest, Response> {
    if let Some(rejection) = check_token(state, headers, query) {
        return Err(rejection);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        warn!(error = %err, "malformed run request body");
        error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {err}"))
    })
}

fn require_user(request: &RunRequest) -> Result<&str, Response> {
    request
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "user_id is required"))
}

fn outcome_response(result: Result<SyncOutcome, SyncError>) -> Response {
    match result {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err @ SyncError::Busy(_)) => error_response(StatusCode::TOO_MANY_REQUESTS, err.to_string()),
        Err(err) => {
            error!(error = %err, "run failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "scheduler_enabled": state.scheduler_enabled,
        "schedule_hours": state.schedule_hours,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    let request = match authorize(&state, &headers, &query, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    let user_id = match require_user(&request) {
        Ok(user_id) => user_id.to_string(),
        Err(rejection) => return rejection,
    };
    let guard = match state.orchestrator.reserve(&user_id) {
        Ok(guard) => guard,
        Err(err) => return error_response(StatusCode::TOO_MANY_REQUESTS, err.to_string()),
    };

    let orchestrator = state.orchestrator.clone();
    let date = request.date;
    tokio::spawn(async move {
        let outcome = orchestrator.synchronize_reserved(&guard, date).await;
        info!(user_id = guard.user_id(), status = ?outcome.status, "background run finished");
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "started", "user_id": user_id, "date": date })),
    )
        .into_response()
}

async fn run_streams_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    let request = match authorize(&state, &headers, &query, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    match require_user(&request) {
        Ok(user_id) => outcome_response(state.orchestrator.run_streams(user_id, request.date).await),
        Err(rejection) => rejection,
    }
}

async fn run_followers_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    let request = match authorize(&state, &headers, &query, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    match require_user(&request) {
        Ok(user_id) => outcome_response(state.orchestrator.run_followers(user_id, request.date).await),
        Err(rejection) => rejection,
    }
}

async fn run_health_check_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    let request = match authorize(&state, &headers, &query, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    match require_user(&request) {
        Ok(user_id) => {
            outcome_response(state.orchestrator.run_health_check(user_id, request.date).await)
        }
        Err(rejection) => rejection,
    }
}
