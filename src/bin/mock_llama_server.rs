//! Mock llama-server for testing FlexLLama.
//!
//! Accepts the argument list the gateway composes for a real llama-server
//! (`--host/--port/--model/--alias` plus the recognized model flags, which
//! are accepted and ignored) and serves the OpenAI-compatible endpoints the
//! gateway proxies to.
//!
//! Behavior knobs come from environment variables so tests can exercise the
//! gateway's env composition:
//! - `MOCK_LLAMA_STARTUP_DELAY_MS`: sleep before binding the port
//! - `MOCK_LLAMA_LOADING_MS`: window after bind during which /health and the
//!   inference endpoints answer 503 "Loading model"
//! - `MOCK_LLAMA_LATENCY_MS`: per-request artificial latency

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-llama-server")]
#[command(about = "Mock llama-server for testing")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Model file to "serve"
    #[arg(long, default_value = "mock.gguf")]
    model: String,

    /// Public alias reported back in responses
    #[arg(long)]
    alias: Option<String>,

    /// Context size (accepted for compatibility, ignored)
    #[arg(long = "ctx-size")]
    ctx_size: Option<u64>,

    /// Batch size (ignored)
    #[arg(long = "batch-size")]
    batch_size: Option<u64>,

    /// Thread count (ignored)
    #[arg(long)]
    threads: Option<u64>,

    /// GPU layers (ignored)
    #[arg(long = "n-gpu-layers")]
    n_gpu_layers: Option<i64>,

    /// Pooling strategy (ignored)
    #[arg(long)]
    pooling: Option<String>,

    /// Embedding mode (ignored, accepted for compatibility)
    #[arg(long)]
    embedding: bool,

    /// Reranking mode (ignored)
    #[arg(long)]
    reranking: bool,

    /// Jinja templating (ignored)
    #[arg(long)]
    jinja: bool,

    /// Memory locking (ignored)
    #[arg(long)]
    mlock: bool,

    /// Any remaining llama-server flags are accepted and ignored
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    passthrough: Vec<String>,
}

struct MockState {
    model: String,
    alias: String,
    loading_until: Instant,
    latency: Duration,
    request_count: AtomicU64,
}

impl MockState {
    fn is_loading(&self) -> bool {
        Instant::now() < self.loading_until
    }
}

fn env_ms(name: &str) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mock_llama_server=debug")
        .try_init();

    let args = Args::parse();

    let startup_delay = env_ms("MOCK_LLAMA_STARTUP_DELAY_MS");
    if startup_delay > 0 {
        info!(delay_ms = startup_delay, "Simulating startup delay");
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let alias = args.alias.clone().unwrap_or_else(|| args.model.clone());
    let state = Arc::new(MockState {
        model: args.model.clone(),
        alias,
        loading_until: Instant::now() + Duration::from_millis(env_ms("MOCK_LLAMA_LOADING_MS")),
        latency: Duration::from_millis(env_ms("MOCK_LLAMA_LATENCY_MS")),
        request_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, model = %args.model, "Mock llama-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

fn loading_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": {
                "code": 503,
                "message": "Loading model",
                "type": "unavailable_error"
            }
        })),
    )
        .into_response()
}

async fn health(State(state): State<Arc<MockState>>) -> Response {
    if state.is_loading() {
        return loading_response();
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn list_models(State(state): State<Arc<MockState>>) -> Response {
    Json(json!({
        "object": "list",
        "data": [{"id": state.alias, "object": "model", "created": 0, "owned_by": "mock"}]
    }))
    .into_response()
}

async fn chat_completions(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if state.is_loading() {
        return loading_response();
    }
    tokio::time::sleep(state.latency).await;
    let n = state.request_count.fetch_add(1, Ordering::SeqCst);

    let streaming = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if streaming {
        return sse_response(&state.alias, n);
    }

    Json(json!({
        "id": format!("chatcmpl-{n}"),
        "object": "chat.completion",
        "created": 0,
        "model": state.alias,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("mock reply {n} from {}", state.model)},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 3, "total_tokens": 4}
    }))
    .into_response()
}

async fn completions(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if state.is_loading() {
        return loading_response();
    }
    tokio::time::sleep(state.latency).await;
    let n = state.request_count.fetch_add(1, Ordering::SeqCst);

    let streaming = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if streaming {
        return sse_response(&state.alias, n);
    }

    Json(json!({
        "id": format!("cmpl-{n}"),
        "object": "text_completion",
        "created": 0,
        "model": state.alias,
        "choices": [{"index": 0, "text": format!("mock completion {n}"), "finish_reason": "stop"}]
    }))
    .into_response()
}

async fn embeddings(State(state): State<Arc<MockState>>, Json(_body): Json<Value>) -> Response {
    if state.is_loading() {
        return loading_response();
    }
    tokio::time::sleep(state.latency).await;

    Json(json!({
        "object": "list",
        "model": state.alias,
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}]
    }))
    .into_response()
}

async fn rerank(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if state.is_loading() {
        return loading_response();
    }
    tokio::time::sleep(state.latency).await;

    let documents = body
        .get("documents")
        .and_then(|d| d.as_array())
        .map(|d| d.len())
        .unwrap_or(0);
    let results: Vec<Value> = (0..documents)
        .map(|i| json!({"index": i, "relevance_score": 1.0 / (i as f64 + 1.0)}))
        .collect();

    Json(json!({"model": state.alias, "results": results})).into_response()
}

/// Three SSE chunks followed by the `[DONE]` sentinel.
fn sse_response(alias: &str, n: u64) -> Response {
    let frames = vec![
        format!(
            "data: {}\n\n",
            json!({
                "id": format!("chatcmpl-{n}"),
                "object": "chat.completion.chunk",
                "model": alias,
                "choices": [{"index": 0, "delta": {"role": "assistant"}}]
            })
        ),
        format!(
            "data: {}\n\n",
            json!({
                "id": format!("chatcmpl-{n}"),
                "object": "chat.completion.chunk",
                "model": alias,
                "choices": [{"index": 0, "delta": {"content": format!("mock stream {n}")}}]
            })
        ),
        format!(
            "data: {}\n\n",
            json!({
                "id": format!("chatcmpl-{n}"),
                "object": "chat.completion.chunk",
                "model": alias,
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
            })
        ),
        "data: [DONE]\n\n".to_string(),
    ];

    let stream = futures_util::stream::iter(
        frames
            .into_iter()
            .map(|f| Ok::<_, std::convert::Infallible>(f)),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap()
}
