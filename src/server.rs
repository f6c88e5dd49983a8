//! OpenAI-compatible HTTP façade.
//!
//! Terminates client HTTP, extracts the model alias from each request body,
//! drives the supervisor to a ready runner (with loading retries), and
//! reverse-proxies the original body to the runner's identical path.

use crate::config::ModelKind;
use crate::health::{self, HealthCache, HealthSnapshot, HealthStatus, ProbeError};
use crate::proxy::{UpstreamClient, UpstreamError};
use crate::retry::RetryPolicy;
use crate::runner::{RequestPermit, Runner, RunnerError};
use crate::supervisor::Supervisor;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Matches the original's 10 MB limit so vision payloads fit.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub supervisor: Supervisor,
    pub client: UpstreamClient,
    pub health_cache: HealthCache,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub streaming_timeout: Option<Duration>,
    pub models_response: Arc<serde_json::Value>,
}

pub(crate) fn build_router(state: AppState, health_endpoint: &str) -> Router {
    Router::new()
        .route("/v1/models", get(handle_models).options(handle_preflight))
        .route(
            "/v1/chat/completions",
            post(handle_chat_completions).options(handle_preflight),
        )
        .route(
            "/v1/completions",
            post(handle_completions).options(handle_preflight),
        )
        .route(
            "/v1/embeddings",
            post(handle_embeddings).options(handle_preflight),
        )
        .route("/v1/rerank", post(handle_rerank).options(handle_preflight))
        .route("/v1/runners/status", get(handle_runners_status))
        .route("/v1/runners/{runner_id}/start", post(handle_runner_start))
        .route("/v1/runners/{runner_id}/stop", post(handle_runner_stop))
        .route(
            "/v1/runners/{runner_id}/restart",
            post(handle_runner_restart),
        )
        .route(health_endpoint, get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// OpenAI endpoints
// ---------------------------------------------------------------------------

async fn handle_models(State(state): State<AppState>) -> Response {
    Json((*state.models_response).clone()).into_response()
}

async fn handle_preflight() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
        .body(Body::empty())
        .unwrap()
}

async fn handle_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch(state, "/v1/chat/completions", body, None, true).await
}

async fn handle_completions(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch(state, "/v1/completions", body, None, true).await
}

async fn handle_embeddings(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch(
        state,
        "/v1/embeddings",
        body,
        Some(ModelKind::Embedding),
        false,
    )
    .await
}

async fn handle_rerank(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch(state, "/v1/rerank", body, Some(ModelKind::Reranking), false).await
}

/// The common dispatch path: resolve the alias, get a ready runner with an
/// admission permit, forward the original body verbatim.
async fn dispatch(
    state: AppState,
    path: &'static str,
    body: Bytes,
    required_kind: Option<ModelKind>,
    allow_stream: bool,
) -> Response {
    counter!("flexllama_requests_total", "endpoint" => path).increment(1);

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };

    let alias = match extract_model(&payload) {
        Some(alias) => alias,
        None => match state.supervisor.default_alias() {
            Some(alias) => {
                debug!(model = %alias, "No model in request, defaulting to first catalog entry");
                alias.clone()
            }
            None => return error_response(StatusCode::BAD_REQUEST, "Model not specified"),
        },
    };

    let Some(kind) = state.supervisor.model_kind(&alias) else {
        warn!(model = %alias, "Request for unknown model");
        return error_response(StatusCode::NOT_FOUND, &format!("Model not found: {alias}"));
    };
    if let Some(required) = required_kind
        && kind != required
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Model {alias} does not support {path}"),
        );
    }

    let streaming = allow_stream
        && payload
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

    let (runner, permit) = match prepare_with_retry(&state, &alias).await {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    if streaming {
        debug!(model = %alias, endpoint = path, "Forwarding streaming request");
        match state
            .client
            .forward_streaming(
                runner.host(),
                runner.port(),
                path,
                body,
                permit,
                state.streaming_timeout,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => upstream_error_response(&alias, e),
        }
    } else {
        debug!(model = %alias, endpoint = path, "Forwarding buffered request");
        let result = state
            .client
            .forward_buffered(runner.host(), runner.port(), path, body, state.request_timeout)
            .await;
        drop(permit);

        match result {
            Ok(upstream) => {
                let mut builder = Response::builder().status(upstream.status);
                if let Some(content_type) = upstream.content_type {
                    builder = builder.header(header::CONTENT_TYPE, content_type);
                }
                builder.body(Body::from(upstream.body)).unwrap()
            }
            Err(e) => upstream_error_response(&alias, e),
        }
    }
}

enum PrepareError {
    /// Admission raced with a starting swap; go around.
    Draining,
    /// The upstream is still warming up; worth a backoff retry.
    Retryable(String),
    /// Final answer for the client.
    Fatal(Response),
}

/// Drive the runner to ready and acquire an admission permit, retrying
/// "model loading" phases per the configured backoff. Retries stop here;
/// nothing is retried once the upstream call begins.
async fn prepare_with_retry(
    state: &AppState,
    alias: &str,
) -> Result<(Runner, RequestPermit), Response> {
    let mut attempt: u32 = 0;
    loop {
        match try_prepare(state, alias).await {
            Ok(pair) => return Ok(pair),
            Err(PrepareError::Draining) => {
                debug!(model = %alias, "Runner draining, re-entering prepare");
                continue;
            }
            Err(PrepareError::Retryable(reason)) if attempt < state.retry.max_retries() => {
                let delay = state.retry.delay(attempt);
                attempt += 1;
                info!(
                    model = %alias,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Model not ready, retrying"
                );
                counter!("flexllama_retries_total", "model" => alias.to_string()).increment(1);
                tokio::time::sleep(delay).await;
            }
            Err(PrepareError::Retryable(reason)) => {
                warn!(model = %alias, reason = %reason, "Model not ready after retries");
                return Err(error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &format!("Model not ready: {reason}"),
                ));
            }
            Err(PrepareError::Fatal(response)) => return Err(response),
        }
    }
}

async fn try_prepare(
    state: &AppState,
    alias: &str,
) -> Result<(Runner, RequestPermit), PrepareError> {
    let runner = match state.supervisor.resolve_and_prepare(alias).await {
        Ok(runner) => runner.clone(),
        Err(e) => {
            error!(model = %alias, error = %e, "Failed to prepare runner");
            return Err(PrepareError::Fatal(runner_error_response(e)));
        }
    };

    // The port accepting connections does not mean the model finished
    // loading; llama-server answers 503 on /health until it has.
    if let Err(e) = health::probe_endpoint(runner.host(), runner.port()).await {
        return Err(match e {
            ProbeError::Loading(message) => PrepareError::Retryable(message),
            // Refused connects right after a successful load fall in the
            // same warm-up window.
            ProbeError::Unreachable(message) => PrepareError::Retryable(message),
            ProbeError::Unhealthy { status, message } => PrepareError::Fatal(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("Model not ready: HTTP {status}: {message}"),
            )),
        });
    }

    match runner.acquire(alias).await {
        Some(permit) => Ok((runner, permit)),
        None => Err(PrepareError::Draining),
    }
}

// ---------------------------------------------------------------------------
// Health + runner control
// ---------------------------------------------------------------------------

async fn handle_health(State(state): State<AppState>) -> Response {
    let mut active_runners = serde_json::Map::new();
    let mut runner_current_models = serde_json::Map::new();
    let mut runner_info = serde_json::Map::new();

    for (id, runner) in state.supervisor.runners() {
        let snap = runner.snapshot().await;
        active_runners.insert(id.clone(), json!(snap.process_alive));
        runner_current_models.insert(id.clone(), json!(snap.current_model));

        let mut info = json!({
            "host": runner.host(),
            "port": runner.port(),
            "current_model": snap.current_model,
            "is_active": snap.process_alive,
            "auto_unload_timeout_seconds": runner.config().auto_unload_timeout_seconds,
        });
        if let Some(countdown) = snap.auto_unload_countdown_seconds {
            info["auto_unload_countdown_seconds"] = json!(countdown);
        }
        runner_info.insert(id.clone(), info);
    }

    let mut model_health = serde_json::Map::new();
    for alias in state.supervisor.aliases() {
        let snapshot = match state.health_cache.get(alias) {
            Some(entry) => entry.value().clone(),
            None => fallback_snapshot(&state, alias).await,
        };
        model_health.insert(
            alias.clone(),
            json!({"status": snapshot.status, "message": snapshot.message}),
        );
    }

    Json(json!({
        "status": "ok",
        "active_runners": active_runners,
        "runner_current_models": runner_current_models,
        "runner_info": runner_info,
        "model_health": model_health,
    }))
    .into_response()
}

/// Derive a snapshot from runner state alone, for the window before the
/// aggregator's first pass.
async fn fallback_snapshot(state: &AppState, alias: &str) -> HealthSnapshot {
    match state.supervisor.runner_for(alias) {
        Some(runner) => {
            let snap = runner.snapshot().await;
            if !snap.process_alive {
                HealthSnapshot::new(HealthStatus::NotRunning, "Runner not running")
            } else if snap.current_model.as_deref() != Some(alias) {
                HealthSnapshot::new(HealthStatus::NotLoaded, "Model not loaded in runner")
            } else {
                HealthSnapshot::new(HealthStatus::Loading, "Health probe pending")
            }
        }
        None => HealthSnapshot::new(HealthStatus::Error, "No runner available"),
    }
}

async fn handle_runners_status(State(state): State<AppState>) -> Response {
    let mut runners = serde_json::Map::new();
    for (id, runner) in state.supervisor.runners() {
        let snap = runner.snapshot().await;
        runners.insert(
            id.clone(),
            json!({
                "is_running": snap.process_alive,
                "status": snap.status,
                "current_model": snap.current_model,
                "available_models": runner.models().iter().map(|m| m.alias()).collect::<Vec<_>>(),
                "host": runner.host(),
                "port": runner.port(),
                "last_error": snap.last_error,
            }),
        );
    }
    Json(json!({"success": true, "runners": runners})).into_response()
}

async fn handle_runner_start(
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
) -> Response {
    control(state, runner_id, "start").await
}

async fn handle_runner_stop(
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
) -> Response {
    control(state, runner_id, "stop").await
}

async fn handle_runner_restart(
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
) -> Response {
    control(state, runner_id, "restart").await
}

async fn control(state: AppState, runner_id: String, action: &'static str) -> Response {
    let Some(runner) = state.supervisor.runner(&runner_id) else {
        return control_error(
            StatusCode::NOT_FOUND,
            &format!("Unknown runner: {runner_id}"),
        );
    };

    info!(runner = %runner_id, action, "Runner control request");
    let result = match action {
        "start" => runner.control_start().await,
        "stop" => runner.control_stop().await,
        _ => runner.control_restart().await,
    };

    match result {
        Ok(()) => Json(json!({
            "success": true,
            "message": format!("Runner {runner_id} {action} completed"),
            "runner_name": runner_id,
            "action": action,
        }))
        .into_response(),
        Err(e @ RunnerError::Busy(_)) => control_error(StatusCode::CONFLICT, &e.to_string()),
        Err(e) => {
            error!(runner = %runner_id, action, error = %e, "Runner control failed");
            control_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to {action} runner {runner_id}: {e}"),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn extract_model(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": {
            "message": message,
            "type": "flexllama_error"
        }
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn control_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"success": false, "error": {"message": message}})),
    )
        .into_response()
}

fn runner_error_response(error: RunnerError) -> Response {
    let (status, message) = match &error {
        RunnerError::UnknownModel { model, .. } => {
            (StatusCode::NOT_FOUND, format!("Model not found: {model}"))
        }
        RunnerError::Load { .. } => (StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
        RunnerError::Busy(_) => (StatusCode::CONFLICT, error.to_string()),
        RunnerError::NoModels(_) | RunnerError::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    };
    error_response(status, &message)
}

fn upstream_error_response(alias: &str, error: UpstreamError) -> Response {
    error!(model = %alias, error = %error, "Upstream request failed");
    let (status, message) = match &error {
        UpstreamError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            format!("Request to model {alias} timed out"),
        ),
        UpstreamError::Connect(detail) | UpstreamError::Body(detail) => (
            StatusCode::BAD_GATEWAY,
            format!("Error forwarding request to {alias}: {detail}"),
        ),
    };
    error_response(status, &message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_from_payload() {
        let payload = serde_json::json!({"model": "mistral", "messages": []});
        assert_eq!(extract_model(&payload), Some("mistral".to_string()));

        let payload = serde_json::json!({"messages": []});
        assert_eq!(extract_model(&payload), None);

        let payload = serde_json::json!({"model": 7});
        assert_eq!(extract_model(&payload), None);
    }

    #[test]
    fn error_envelope_shape() {
        let response = error_response(StatusCode::NOT_FOUND, "Model not found: x");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn runner_errors_map_to_public_codes() {
        let response = runner_error_response(RunnerError::UnknownModel {
            runner: "r1".to_string(),
            model: "m".to_string(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = runner_error_response(RunnerError::Load {
            runner: "r1".to_string(),
            model: "m".to_string(),
            reason: "spawn failed".to_string(),
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = runner_error_response(RunnerError::Busy("r1".to_string()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn upstream_errors_map_to_public_codes() {
        let response = upstream_error_response("m", UpstreamError::Timeout);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response =
            upstream_error_response("m", UpstreamError::Connect("refused".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
