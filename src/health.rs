//! Model health probing and aggregation.
//!
//! One probe function backs two consumers: the background aggregator that
//! refreshes the `/health` cache every couple of seconds, and the router's
//! preflight check that decides whether a request should wait out a model
//! that is still warming up.

use crate::runner::{Runner, RunnerStatus};
use crate::supervisor::Supervisor;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Empty};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::trace;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const AGGREGATOR_INTERVAL: Duration = Duration::from_secs(2);

/// Per-alias health as exposed on the aggregate `/health` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Loading,
    Error,
    NotLoaded,
    NotRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip)]
    pub observed_at: Instant,
}

impl HealthSnapshot {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            observed_at: Instant::now(),
        }
    }
}

/// Shared alias → snapshot cache, written by the aggregator.
pub type HealthCache = Arc<DashMap<String, HealthSnapshot>>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("model is still loading: {0}")]
    Loading(String),

    #[error("health endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("health check failed with status {status}: {message}")]
    Unhealthy { status: u16, message: String },
}

/// Best-effort extraction of `error.message` from an upstream error body.
pub(crate) fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(message) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
    {
        return message.to_string();
    }
    String::from_utf8_lossy(body).chars().take(100).collect()
}

/// Whether an upstream 503 body is the llama-server "still loading" marker.
pub(crate) fn is_loading_message(message: &str) -> bool {
    message.to_lowercase().contains("loading")
}

/// Probe a runner-local `/health` endpoint and classify the answer.
pub async fn probe_endpoint(host: &str, port: u16) -> Result<(), ProbeError> {
    let client: hyper_util::client::legacy::Client<_, Empty<Bytes>> =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build_http();

    let uri: hyper::Uri = format!("http://{host}:{port}/health")
        .parse()
        .map_err(|e| ProbeError::Unreachable(format!("invalid health url: {e}")))?;
    let request = hyper::Request::builder()
        .method("GET")
        .uri(uri)
        .body(Empty::new())
        .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

    let response = match tokio::time::timeout(PROBE_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(ProbeError::Unreachable(e.to_string())),
        Err(_) => return Err(ProbeError::Unreachable("health probe timed out".to_string())),
    };

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let message = upstream_error_message(&body);

    if status.as_u16() == 503 && is_loading_message(&message) {
        Err(ProbeError::Loading(message))
    } else {
        Err(ProbeError::Unhealthy {
            status: status.as_u16(),
            message,
        })
    }
}

/// Derive one alias's health from its runner's state plus a live probe.
pub async fn probe_alias(runner: &Runner, alias: &str) -> HealthSnapshot {
    let snap = runner.snapshot().await;

    if !snap.process_alive {
        return HealthSnapshot::new(HealthStatus::NotRunning, "Runner not running");
    }
    if snap.current_model.as_deref() != Some(alias) {
        return HealthSnapshot::new(HealthStatus::NotLoaded, "Model not loaded in runner");
    }

    match probe_endpoint(runner.host(), runner.port()).await {
        Ok(()) => HealthSnapshot::new(HealthStatus::Ok, "Ready"),
        Err(ProbeError::Loading(message)) => HealthSnapshot::new(HealthStatus::Loading, message),
        // A refused connect while the port is still coming up is the same
        // warm-up phase, not a failure.
        Err(ProbeError::Unreachable(_)) if snap.status == RunnerStatus::Launching => {
            HealthSnapshot::new(HealthStatus::Loading, "Model is still loading")
        }
        Err(e) => HealthSnapshot::new(HealthStatus::Error, e.to_string()),
    }
}

/// Spawn the background aggregator refreshing the health cache.
pub fn spawn_aggregator(supervisor: Supervisor, cache: HealthCache) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(AGGREGATOR_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            for alias in supervisor.aliases() {
                let Some(runner) = supervisor.runner_for(alias) else {
                    continue;
                };
                let snapshot = probe_alias(runner, alias).await;
                trace!(model = %alias, status = ?snapshot.status, "Health snapshot refreshed");
                cache.insert(alias.clone(), snapshot);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::get};
    use tokio::net::TcpListener;

    #[test]
    fn extracts_error_message_from_json() {
        let body = br#"{"error":{"code":503,"message":"Loading model","type":"unavailable_error"}}"#;
        assert_eq!(upstream_error_message(body), "Loading model");
    }

    #[test]
    fn falls_back_to_raw_body() {
        assert_eq!(upstream_error_message(b"plain failure"), "plain failure");
    }

    #[test]
    fn loading_marker_is_case_insensitive() {
        assert!(is_loading_message("Loading model"));
        assert!(is_loading_message("model is still LOADING"));
        assert!(!is_loading_message("out of memory"));
    }

    #[tokio::test]
    async fn probe_unreachable_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = probe_endpoint("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unreachable(_)));
    }

    #[tokio::test]
    async fn probe_classifies_loading_and_ok() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let loading = Arc::new(AtomicBool::new(true));
        let loading_flag = Arc::clone(&loading);

        let app = Router::new().route(
            "/health",
            get(move || {
                let loading = Arc::clone(&loading_flag);
                async move {
                    if loading.load(Ordering::SeqCst) {
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            Json(serde_json::json!({
                                "error": {"code": 503, "message": "Loading model"}
                            })),
                        )
                    } else {
                        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
                    }
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = probe_endpoint("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Loading(_)));

        loading.store(false, Ordering::SeqCst);
        probe_endpoint("127.0.0.1", port).await.unwrap();
    }
}
