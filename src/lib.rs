//! # FlexLLama
//!
//! OpenAI-compatible gateway multiplexing a fleet of llama.cpp `llama-server`
//! processes. Each configured runner is one child-process slot bound to a
//! local port and hosting at most one model at a time; the gateway resolves
//! the `model` alias of every request to its runner, swaps models as needed,
//! and reverse-proxies the request (buffered or streaming).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      flexllama                         │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │ Router (axum)                                    │  │
//! │  │ - extracts model alias from request body         │  │
//! │  │ - preflight readiness probe + loading retries    │  │
//! │  │ - acquires an admission permit                   │  │
//! │  └──────────────────────────────────────────────────┘  │
//! │                         │                              │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │ Supervisor → Runner (per slot)                   │  │
//! │  │ - load lock + in-flight drain                    │  │
//! │  │ - spawn / port-wait / stop with escalation       │  │
//! │  │ - idle auto-unload ticker                        │  │
//! │  └──────────────────────────────────────────────────┘  │
//! │                         │                              │
//! │      ┌──────────────────┼──────────────────┐           │
//! │      ▼                  ▼                  ▼           │
//! │ [llama-server:9001] [llama-server:9002] [...]          │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod config;
mod health;
mod process;
mod proxy;
mod retry;
mod runner;
mod server;
mod supervisor;
pub mod telemetry;

pub use config::{
    ApiConfig, Config, ConfigError, FlashAttn, ModelConfig, ModelKind, RetryConfig, RunnerConfig,
};
pub use health::{HealthSnapshot, HealthStatus};
pub use retry::RetryPolicy;
pub use runner::{Runner, RunnerError, RunnerSnapshot, RunnerStatus};
pub use supervisor::Supervisor;

use axum::Router;
use axum::routing::get;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build the complete gateway stack.
///
/// Returns the main router, the optional Prometheus metrics router, and the
/// supervisor (for autostart and shutdown). Background tasks — the 1 Hz
/// idle-unload ticker and the health aggregator — are spawned here.
pub async fn build_app(config: Config) -> anyhow::Result<(Router, Option<Router>, Supervisor)> {
    info!(
        models = config.models.len(),
        runners = config.runners.len(),
        "Building gateway"
    );

    let log_dir = process::session_log_dir();
    info!(log_dir = %log_dir.display(), "Runner logs go here");

    let supervisor = Supervisor::new(&config, &log_dir)?;

    let health_cache: health::HealthCache = Arc::new(DashMap::new());
    let _idle_ticker = supervisor.spawn_idle_ticker();
    let _aggregator = health::spawn_aggregator(supervisor.clone(), Arc::clone(&health_cache));

    // Pre-compute /v1/models from the immutable catalog.
    let models_response = {
        let mut data: Vec<_> = config
            .models
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.alias(),
                    "object": "model",
                    "created": 0,
                    "owned_by": "flexllama"
                })
            })
            .collect::<Vec<_>>();
        data.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        serde_json::json!({
            "object": "list",
            "data": data
        })
    };

    let state = server::AppState {
        supervisor: supervisor.clone(),
        client: proxy::UpstreamClient::new(),
        health_cache,
        retry: RetryPolicy::from_config(&config.retry_config),
        request_timeout: Duration::from_secs(config.request_timeout_seconds),
        streaming_timeout: (config.streaming_timeout_seconds > 0)
            .then(|| Duration::from_secs(config.streaming_timeout_seconds)),
        models_response: Arc::new(models_response),
    };

    let app = server::build_router(state, &config.api.health_endpoint);

    let metrics_router = telemetry::install().map(|handle| {
        Router::new().route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
    });

    Ok((app, metrics_router, supervisor))
}
