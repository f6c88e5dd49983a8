//! Supervisor: owns every runner and the alias → runner mapping.
//!
//! Runners are independent islands; the supervisor never stops one runner to
//! free resources for another. Models sharing a GPU are expressed by
//! assigning them to the same runner, where the load lock makes them
//! mutually exclusive.

use crate::config::{Config, ConfigError, ModelKind};
use crate::runner::{Runner, RunnerError};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct SupervisorInner {
    runners: HashMap<String, Runner>,
    /// alias → runner id
    model_runner: HashMap<String, String>,
    /// alias → kind, for endpoint gating
    model_kinds: HashMap<String, ModelKind>,
    /// catalog aliases in declaration order
    aliases: Vec<String>,
}

/// Process-wide owner of all runners. Cheap to clone.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Clone for Supervisor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Supervisor {
    pub fn new(config: &Config, log_dir: &Path) -> Result<Self, ConfigError> {
        let mut runners = HashMap::new();
        for (id, runner_config) in &config.runners {
            let host = config.runner_host(runner_config);
            let models: Vec<_> = config
                .models
                .iter()
                .filter(|m| &m.runner == id)
                .cloned()
                .collect();
            if models.is_empty() {
                warn!(runner = %id, "Runner has no models assigned");
            }
            runners.insert(
                id.clone(),
                Runner::new(id.clone(), runner_config.clone(), host, models, log_dir),
            );
        }

        let mut model_runner = HashMap::new();
        let mut model_kinds = HashMap::new();
        let mut aliases = Vec::new();
        for model in &config.models {
            let alias = model.alias();
            model_runner.insert(alias.clone(), model.runner.clone());
            model_kinds.insert(alias.clone(), model.effective_kind());
            aliases.push(alias);
        }

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                runners,
                model_runner,
                model_kinds,
                aliases,
            }),
        })
    }

    pub fn runner(&self, id: &str) -> Option<&Runner> {
        self.inner.runners.get(id)
    }

    pub fn runners(&self) -> impl Iterator<Item = (&String, &Runner)> {
        self.inner.runners.iter()
    }

    pub fn runner_ids(&self) -> Vec<String> {
        self.inner.runners.keys().cloned().collect()
    }

    /// Catalog aliases in declaration order.
    pub fn aliases(&self) -> &[String] {
        &self.inner.aliases
    }

    pub fn default_alias(&self) -> Option<&String> {
        self.inner.aliases.first()
    }

    pub fn model_kind(&self, alias: &str) -> Option<ModelKind> {
        self.inner.model_kinds.get(alias).copied()
    }

    /// The runner hosting `alias`, if the alias is in the catalog.
    pub fn runner_for(&self, alias: &str) -> Option<&Runner> {
        let id = self.inner.model_runner.get(alias)?;
        self.inner.runners.get(id)
    }

    /// Resolve the alias and drive its runner to ready.
    pub async fn resolve_and_prepare(&self, alias: &str) -> Result<&Runner, RunnerError> {
        let runner = self.runner_for(alias).ok_or_else(|| {
            RunnerError::UnknownModel {
                runner: "<none>".to_string(),
                model: alias.to_string(),
            }
        })?;
        runner.ensure_loaded(alias).await?;
        Ok(runner)
    }

    /// Load each runner's default model at boot. Failures are logged and do
    /// not abort startup; the model stays loadable on first request.
    pub async fn autostart_defaults(&self) {
        let tasks = self.inner.runners.values().map(|runner| {
            let runner = runner.clone();
            async move {
                let Some(alias) = runner.default_model_alias() else {
                    return;
                };
                info!(runner = %runner.id(), model = %alias, "Auto-starting runner");
                if let Err(e) = runner.ensure_loaded(&alias).await {
                    error!(runner = %runner.id(), model = %alias, error = %e, "Auto-start failed");
                }
            }
        });
        join_all(tasks).await;
    }

    /// Spawn the 1 Hz idle-unload ticker.
    pub fn spawn_idle_ticker(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for runner in supervisor.inner.runners.values() {
                    runner.maybe_unload_idle().await;
                }
            }
        })
    }

    /// Stop every runner: drain and unload concurrently within `grace`,
    /// then force-kill whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "Shutting down all runners");
        let tasks = self.inner.runners.values().map(|runner| {
            let runner = runner.clone();
            async move {
                if tokio::time::timeout(grace, runner.unload()).await.is_err() {
                    warn!(runner = %runner.id(), "Graceful unload timed out, killing process");
                    runner.kill_now().await;
                }
            }
        });
        join_all(tasks).await;
        info!("All runners stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, ModelConfig, RetryConfig, RunnerConfig};

    fn test_config() -> Config {
        Config {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                health_endpoint: "/health".to_string(),
            },
            models: vec![
                ModelConfig {
                    model: "/models/a.gguf".to_string(),
                    runner: "r1".to_string(),
                    model_alias: Some("model-a".to_string()),
                    ..ModelConfig::default()
                },
                ModelConfig {
                    model: "/models/b.gguf".to_string(),
                    runner: "r1".to_string(),
                    model_alias: Some("model-b".to_string()),
                    ..ModelConfig::default()
                },
                ModelConfig {
                    model: "/models/embed.gguf".to_string(),
                    runner: "r2".to_string(),
                    model_alias: Some("embedder".to_string()),
                    embedding: true,
                    ..ModelConfig::default()
                },
            ],
            auto_start_runners: false,
            retry_config: RetryConfig::default(),
            request_timeout_seconds: 30,
            streaming_timeout_seconds: 0,
            metrics_port: 0,
            runners: HashMap::from([
                (
                    "r1".to_string(),
                    RunnerConfig {
                        port: 9001,
                        ..RunnerConfig::default()
                    },
                ),
                (
                    "r2".to_string(),
                    RunnerConfig {
                        port: 9002,
                        ..RunnerConfig::default()
                    },
                ),
            ]),
        }
    }

    #[test]
    fn builds_alias_and_kind_maps() {
        let config = test_config();
        let supervisor = Supervisor::new(&config, std::env::temp_dir().as_path()).unwrap();

        assert_eq!(
            supervisor.aliases(),
            &["model-a", "model-b", "embedder"]
        );
        assert_eq!(supervisor.default_alias().unwrap(), "model-a");
        assert_eq!(supervisor.model_kind("model-a"), Some(ModelKind::Chat));
        assert_eq!(supervisor.model_kind("embedder"), Some(ModelKind::Embedding));
        assert_eq!(supervisor.model_kind("missing"), None);

        assert_eq!(supervisor.runner_for("model-a").unwrap().id(), "r1");
        assert_eq!(supervisor.runner_for("model-b").unwrap().id(), "r1");
        assert_eq!(supervisor.runner_for("embedder").unwrap().id(), "r2");
        assert!(supervisor.runner_for("missing").is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_alias_fails() {
        let config = test_config();
        let supervisor = Supervisor::new(&config, std::env::temp_dir().as_path()).unwrap();
        let err = supervisor.resolve_and_prepare("missing").await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownModel { .. }));
    }

    #[tokio::test]
    async fn shutdown_without_processes_is_clean() {
        let config = test_config();
        let supervisor = Supervisor::new(&config, std::env::temp_dir().as_path()).unwrap();
        supervisor.shutdown(Duration::from_secs(1)).await;
        for (_, runner) in supervisor.runners() {
            assert!(!runner.is_process_alive().await);
        }
    }
}
