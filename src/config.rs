//! Configuration for FlexLLama.
//!
//! The config file is a JSON object: known top-level fields (`api`, `models`,
//! `retry_config`, timeouts) plus one object per runner keyed by runner id.
//! Model entries form the immutable catalog; each entry names the runner that
//! hosts it and the llama-server flags it is launched with.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway HTTP server settings
    pub api: ApiConfig,

    /// Model catalog; each entry is assigned to one runner
    pub models: Vec<ModelConfig>,

    /// Load the first model of every runner at boot
    #[serde(default = "default_true")]
    pub auto_start_runners: bool,

    /// Backoff applied while an upstream model is still loading
    #[serde(default)]
    pub retry_config: RetryConfig,

    /// Timeout for buffered (non-streaming) upstream requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Timeout for streaming responses (0 = unbounded)
    #[serde(default)]
    pub streaming_timeout_seconds: u64,

    /// Prometheus metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,

    /// Runner definitions; any remaining top-level object is a runner keyed
    /// by its id
    #[serde(flatten)]
    pub runners: HashMap<String, RunnerConfig>,
}

/// Gateway listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,

    /// Path serving the aggregate health snapshot
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
}

/// One runner slot: a managed llama-server process bound to a fixed port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Runner type, doubling as the binary name when `path` is absent
    #[serde(rename = "type")]
    pub runner_type: String,

    /// Path to the llama-server binary (defaults to `type`)
    #[serde(default)]
    pub path: Option<String>,

    /// Host the child binds to (defaults to the api host)
    #[serde(default)]
    pub host: Option<String>,

    /// Port the child binds to; must be unique across runners
    pub port: u16,

    /// Arguments appended after all model arguments
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment overrides applied to every model on this runner
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether the child inherits the gateway's environment
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// Stop the child after this many idle seconds (0 = never)
    #[serde(default)]
    pub auto_unload_timeout_seconds: u64,

    /// How long to wait for the child's port to accept connections
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_seconds: u64,
}

impl RunnerConfig {
    /// The binary to spawn: explicit `path`, or the runner type.
    pub fn binary(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.runner_type)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_type: "llama-server".to_string(),
            path: None,
            host: None,
            port: 0,
            extra_args: Vec::new(),
            env: HashMap::new(),
            inherit_env: true,
            auto_unload_timeout_seconds: 0,
            launch_timeout_seconds: default_launch_timeout(),
        }
    }
}

/// What a model serves, used to gate the embeddings/rerank endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Completion,
    Embedding,
    Reranking,
    Vision,
}

/// `--flash-attn` accepts a tri-state in recent llama.cpp builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttn {
    On,
    Off,
    Auto,
}

impl FlashAttn {
    fn as_str(self) -> &'static str {
        match self {
            FlashAttn::On => "on",
            FlashAttn::Off => "off",
            FlashAttn::Auto => "auto",
        }
    }
}

/// One catalog entry: a model alias, the runner that hosts it, and the
/// llama-server flags it is launched with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the GGUF model file
    pub model: String,

    /// Id of the runner hosting this model
    pub runner: String,

    /// Public alias; defaults to the model file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_alias: Option<String>,

    /// Explicit kind; otherwise derived from the flags below
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ModelKind>,

    /// Multimodal projector file (vision models)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_batch: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_gpu: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_split: Option<Vec<f64>>,

    #[serde(default)]
    pub use_mlock: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_attn: Option<FlashAttn>,

    /// `false` adds `--no-kv-offload`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_kqv: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_mode: Option<String>,

    #[serde(
        default,
        rename = "cache-type-k",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_type_k: Option<String>,

    #[serde(
        default,
        rename = "cache-type-v",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_type_v: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,

    #[serde(default)]
    pub jinja: bool,

    #[serde(
        default,
        rename = "rope-scaling",
        skip_serializing_if = "Option::is_none"
    )]
    pub rope_scaling: Option<String>,

    #[serde(default, rename = "rope-scale", skip_serializing_if = "Option::is_none")]
    pub rope_scale: Option<f64>,

    #[serde(
        default,
        rename = "yarn-orig-ctx",
        skip_serializing_if = "Option::is_none"
    )]
    pub yarn_orig_ctx: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling: Option<String>,

    #[serde(default)]
    pub embedding: bool,

    #[serde(default)]
    pub reranking: bool,

    /// Free-form extra arguments, tokenized by whitespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,

    /// Environment overrides applied on top of the runner's
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-model override of the runner's `inherit_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_env: Option<bool>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            runner: String::new(),
            model_alias: None,
            kind: None,
            mmproj: None,
            n_ctx: None,
            n_batch: None,
            n_threads: None,
            n_gpu_layers: None,
            main_gpu: None,
            tensor_split: None,
            use_mlock: false,
            flash_attn: None,
            offload_kqv: None,
            split_mode: None,
            cache_type_k: None,
            cache_type_v: None,
            chat_template: None,
            jinja: false,
            rope_scaling: None,
            rope_scale: None,
            yarn_orig_ctx: None,
            pooling: None,
            embedding: false,
            reranking: false,
            args: None,
            env: HashMap::new(),
            inherit_env: None,
        }
    }
}

impl ModelConfig {
    /// Public alias: `model_alias`, or the file name of the model path.
    pub fn alias(&self) -> String {
        match &self.model_alias {
            Some(alias) => alias.clone(),
            None => Path::new(&self.model)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.model.clone()),
        }
    }

    /// Effective kind: explicit `kind`, else derived from the flags.
    pub fn effective_kind(&self) -> ModelKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        if self.embedding {
            ModelKind::Embedding
        } else if self.reranking {
            ModelKind::Reranking
        } else if self.mmproj.is_some() {
            ModelKind::Vision
        } else {
            ModelKind::Chat
        }
    }

    /// Build the llama-server argument list for this model.
    ///
    /// Order: host/port binding, model and alias, recognized per-model flags,
    /// the free-form `args` string tokenized by whitespace, and finally the
    /// runner's `extra_args`.
    pub fn launch_args(&self, host: &str, port: u16, runner_extra: &[String]) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--alias".to_string(),
            self.alias(),
        ];

        if let Some(ref mmproj) = self.mmproj {
            args.extend(["--mmproj".to_string(), mmproj.clone()]);
        }
        if let Some(n_ctx) = self.n_ctx {
            args.extend(["--ctx-size".to_string(), n_ctx.to_string()]);
        }
        if let Some(n_batch) = self.n_batch {
            args.extend(["--batch-size".to_string(), n_batch.to_string()]);
        }
        if let Some(n_threads) = self.n_threads {
            args.extend(["--threads".to_string(), n_threads.to_string()]);
        }
        if let Some(n_gpu_layers) = self.n_gpu_layers {
            args.extend(["--n-gpu-layers".to_string(), n_gpu_layers.to_string()]);
        }
        if let Some(main_gpu) = self.main_gpu {
            args.extend(["--main-gpu".to_string(), main_gpu.to_string()]);
        }
        if let Some(ref split) = self.tensor_split {
            let joined = split
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",");
            args.extend(["--tensor-split".to_string(), joined]);
        }
        if self.use_mlock {
            args.push("--mlock".to_string());
        }
        if let Some(flash_attn) = self.flash_attn {
            args.extend(["--flash-attn".to_string(), flash_attn.as_str().to_string()]);
        }
        if self.offload_kqv == Some(false) {
            args.push("--no-kv-offload".to_string());
        }
        if let Some(ref split_mode) = self.split_mode {
            args.extend(["--split-mode".to_string(), split_mode.clone()]);
        }
        if let Some(ref k) = self.cache_type_k {
            args.extend(["--cache-type-k".to_string(), k.clone()]);
        }
        if let Some(ref v) = self.cache_type_v {
            args.extend(["--cache-type-v".to_string(), v.clone()]);
        }
        if let Some(ref template) = self.chat_template {
            args.extend(["--chat-template".to_string(), template.clone()]);
        }
        if self.jinja {
            args.push("--jinja".to_string());
        }
        if let Some(ref scaling) = self.rope_scaling {
            args.extend(["--rope-scaling".to_string(), scaling.clone()]);
        }
        if let Some(scale) = self.rope_scale {
            args.extend(["--rope-scale".to_string(), scale.to_string()]);
        }
        if let Some(yarn) = self.yarn_orig_ctx {
            args.extend(["--yarn-orig-ctx".to_string(), yarn.to_string()]);
        }
        if let Some(ref pooling) = self.pooling {
            args.extend(["--pooling".to_string(), pooling.clone()]);
        }
        if self.embedding {
            args.push("--embedding".to_string());
        }
        if self.reranking {
            args.push("--reranking".to_string());
        }

        if let Some(ref extra) = self.args {
            args.extend(extra.split_whitespace().map(str::to_string));
        }

        args.extend(runner_extra.iter().cloned());
        args
    }

    /// Compose the child environment: runner `env` overlaid with model `env`.
    ///
    /// Returns `(inherit, overrides)`; when `inherit` is false the child
    /// starts from an empty environment. The model's `inherit_env` overrides
    /// the runner's setting.
    pub fn compose_env(&self, runner: &RunnerConfig) -> (bool, Vec<(String, String)>) {
        let inherit = self.inherit_env.unwrap_or(runner.inherit_env);

        let mut merged: HashMap<String, String> = HashMap::new();
        for (k, v) in &runner.env {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.env {
            merged.insert(k.clone(), v.clone());
        }

        let mut overrides: Vec<(String, String)> = merged.into_iter().collect();
        overrides.sort();
        (inherit, overrides)
    }
}

/// Backoff policy for upstreams that report "model is loading".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,

    #[serde(default = "default_true")]
    pub retry_on_model_loading: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_seconds: default_base_delay(),
            max_delay_seconds: default_max_delay(),
            retry_on_model_loading: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_request_timeout() -> u64 {
    1800
}

fn default_launch_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    30.0
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::Invalid(
                "configuration must contain at least one model".to_string(),
            ));
        }

        let mut used_ports = HashSet::new();
        for (id, runner) in &self.runners {
            if !used_ports.insert(runner.port) {
                return Err(ConfigError::Invalid(format!(
                    "runner {id}: port {} already in use by another runner",
                    runner.port
                )));
            }
            if runner.port == self.api.port {
                return Err(ConfigError::Invalid(format!(
                    "runner {id}: port {} collides with the api port",
                    runner.port
                )));
            }
        }

        let mut aliases = HashSet::new();
        for model in &self.models {
            let alias = model.alias();
            if !self.runners.contains_key(&model.runner) {
                return Err(ConfigError::Invalid(format!(
                    "model {alias}: referenced runner '{}' not found",
                    model.runner
                )));
            }
            if !aliases.insert(alias.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "model alias '{alias}' is declared more than once"
                )));
            }
        }

        let retry = &self.retry_config;
        if retry.base_delay_seconds < 0.0 || retry.max_delay_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "retry delays must be non-negative".to_string(),
            ));
        }
        if retry.max_delay_seconds < retry.base_delay_seconds {
            return Err(ConfigError::Invalid(
                "max_delay_seconds must be >= base_delay_seconds".to_string(),
            ));
        }

        Ok(())
    }

    /// All catalog aliases in declaration order.
    pub fn aliases(&self) -> Vec<String> {
        self.models.iter().map(|m| m.alias()).collect()
    }

    /// The host a runner's child binds to (runner `host`, or the api host).
    pub fn runner_host(&self, runner: &RunnerConfig) -> String {
        runner
            .host
            .clone()
            .unwrap_or_else(|| self.api.host.clone())
    }
}
