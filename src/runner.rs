//! Runner slots.
//!
//! A [`Runner`] owns one child-process slot: at most one process, at most one
//! loaded model, bound to one host:port. All state-changing operations are
//! serialized behind the load lock; requests are admitted through
//! [`RequestPermit`]s counted by an atomic so a swap can drain in-flight work
//! before touching the process.
//!
//! The admission order is increment-then-check: a permit first bumps the
//! in-flight counter, then inspects the draining flag and runner state, and
//! backs out on mismatch. A drain sets the flag before reading the counter,
//! so the two sides can never miss each other.

use crate::config::{ModelConfig, RunnerConfig};
use crate::process::{self, ChildHandle, SpawnSpec};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{error, info, warn};

/// SIGTERM → SIGKILL escalation window.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("model {model} is not assigned to runner {runner}")]
    UnknownModel { runner: String, model: String },

    #[error("failed to load {model} on runner {runner}: {reason}")]
    Load {
        runner: String,
        model: String,
        reason: String,
    },

    #[error("runner {0} has another control operation in flight")]
    Busy(String),

    #[error("runner {0} has no models assigned")]
    NoModels(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Launching,
    Ready,
    Stopping,
    Failed,
}

/// Point-in-time view of a runner, used by `/health` and the control API.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub status: RunnerStatus,
    pub current_model: Option<String>,
    pub process_alive: bool,
    pub last_error: Option<String>,
    pub auto_unload_countdown_seconds: Option<u64>,
}

#[derive(Debug)]
struct RunnerState {
    status: RunnerStatus,
    current_model: Option<String>,
    child: Option<ChildHandle>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct RunnerInner {
    id: String,
    config: RunnerConfig,
    host: String,
    models: Vec<ModelConfig>,
    log_path: PathBuf,
    state: Mutex<RunnerState>,
    load_lock: Arc<Mutex<()>>,
    control_lock: Mutex<()>,
    in_flight: AtomicUsize,
    in_flight_changed: Notify,
    draining: AtomicBool,
    generation: AtomicU64,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last request start/end or load
    last_activity_ms: AtomicU64,
}

impl RunnerInner {
    fn touch_activity(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_duration(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Detect a child that died behind our back and fold it into the state.
    fn reap_if_dead(&self, st: &mut RunnerState) {
        if let Some(child) = st.child.as_mut()
            && let Some(status) = child.exit_status()
        {
            warn!(
                runner = %self.id,
                model = ?st.current_model,
                status = %status,
                "Runner process exited unexpectedly"
            );
            st.child = None;
            st.current_model = None;
            st.status = RunnerStatus::Failed;
            st.last_error = Some(format!("process exited with {status}"));
        }
    }
}

/// One managed runner slot. Cheap to clone; all clones share state.
#[derive(Debug)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Clone for Runner {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Runner {
    pub fn new(
        id: String,
        config: RunnerConfig,
        host: String,
        models: Vec<ModelConfig>,
        log_dir: &Path,
    ) -> Self {
        let log_path = log_dir.join(format!("{id}.log"));
        Self {
            inner: Arc::new(RunnerInner {
                id,
                config,
                host,
                models,
                log_path,
                state: Mutex::new(RunnerState {
                    status: RunnerStatus::Idle,
                    current_model: None,
                    child: None,
                    last_error: None,
                }),
                load_lock: Arc::new(Mutex::new(())),
                control_lock: Mutex::new(()),
                in_flight: AtomicUsize::new(0),
                in_flight_changed: Notify::new(),
                draining: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                epoch: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.inner.models
    }

    pub fn has_model(&self, alias: &str) -> bool {
        self.inner.models.iter().any(|m| m.alias() == alias)
    }

    /// The runner's default model: the first one assigned to it.
    pub fn default_model_alias(&self) -> Option<String> {
        self.inner.models.first().map(|m| m.alias())
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> RunnerStatus {
        self.snapshot().await.status
    }

    pub async fn current_model(&self) -> Option<String> {
        self.snapshot().await.current_model
    }

    pub async fn is_process_alive(&self) -> bool {
        self.snapshot().await.process_alive
    }

    pub async fn snapshot(&self) -> RunnerSnapshot {
        let mut st = self.inner.state.lock().await;
        self.inner.reap_if_dead(&mut st);

        let countdown = if st.status == RunnerStatus::Ready
            && self.inner.config.auto_unload_timeout_seconds > 0
        {
            Some(
                self.inner
                    .config
                    .auto_unload_timeout_seconds
                    .saturating_sub(self.inner.idle_duration().as_secs()),
            )
        } else {
            None
        };

        RunnerSnapshot {
            status: st.status,
            current_model: st.current_model.clone(),
            process_alive: st.child.is_some(),
            last_error: st.last_error.clone(),
            auto_unload_countdown_seconds: countdown,
        }
    }

    /// Ensure `alias` is loaded and the runner is ready.
    ///
    /// Concurrent calls for the same alias coalesce: one performs the swap,
    /// the rest observe the post-condition through the fast path. The swap
    /// itself runs detached so a disconnecting client cannot cancel it
    /// mid-spawn and orphan the child.
    pub async fn ensure_loaded(&self, alias: &str) -> Result<(), RunnerError> {
        if !self.has_model(alias) {
            return Err(RunnerError::UnknownModel {
                runner: self.inner.id.clone(),
                model: alias.to_string(),
            });
        }

        if self.fast_path(alias).await {
            return Ok(());
        }

        let guard = self.inner.load_lock.clone().lock_owned().await;

        if self.fast_path(alias).await {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let target = alias.to_string();
        let task = tokio::spawn(async move { swap(inner, guard, target).await });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(RunnerError::Internal(format!("swap task panicked: {e}"))),
        }
    }

    async fn fast_path(&self, alias: &str) -> bool {
        let mut st = self.inner.state.lock().await;
        self.inner.reap_if_dead(&mut st);
        if st.status == RunnerStatus::Ready && st.current_model.as_deref() == Some(alias) {
            self.inner.touch_activity();
            true
        } else {
            false
        }
    }

    /// Admit one request for `alias`. Returns `None` when the runner is
    /// draining, not ready, or holds a different model; callers should
    /// re-run `ensure_loaded` and try again.
    pub async fn acquire(&self, alias: &str) -> Option<RequestPermit> {
        let inner = &self.inner;
        inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let admitted = !inner.draining.load(Ordering::SeqCst) && {
            let st = inner.state.lock().await;
            st.status == RunnerStatus::Ready && st.current_model.as_deref() == Some(alias)
        };

        if !admitted {
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            inner.in_flight_changed.notify_waiters();
            return None;
        }

        inner.touch_activity();
        gauge!("flexllama_in_flight", "runner" => inner.id.clone())
            .set(inner.in_flight.load(Ordering::SeqCst) as f64);

        Some(RequestPermit {
            inner: Arc::clone(inner),
        })
    }

    /// Stop the process and clear the loaded model. Idempotent.
    pub async fn unload(&self) {
        let _guard = self.inner.load_lock.clone().lock_owned().await;
        unload_locked(&self.inner).await;
    }

    /// Unload if the auto-unload timeout elapsed with no activity.
    ///
    /// Called from the supervisor's 1 Hz tick; never blocks behind an
    /// in-progress swap.
    pub async fn maybe_unload_idle(&self) {
        let timeout = self.inner.config.auto_unload_timeout_seconds;
        if timeout == 0 {
            return;
        }
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            return;
        }
        {
            let st = self.inner.state.lock().await;
            if st.status != RunnerStatus::Ready {
                return;
            }
        }
        if self.inner.idle_duration() < Duration::from_secs(timeout) {
            return;
        }

        let Ok(_guard) = self.inner.load_lock.clone().try_lock_owned() else {
            return;
        };

        // Re-check under the lock; a request may have slipped in.
        if self.inner.in_flight.load(Ordering::SeqCst) > 0
            || self.inner.idle_duration() < Duration::from_secs(timeout)
        {
            return;
        }

        info!(
            runner = %self.inner.id,
            idle_secs = self.inner.idle_duration().as_secs(),
            "Auto-unloading idle runner"
        );
        counter!("flexllama_auto_unloads_total", "runner" => self.inner.id.clone()).increment(1);
        unload_locked(&self.inner).await;
    }

    /// Immediate teardown without drain, for shutdown escalation.
    pub async fn kill_now(&self) {
        let child = {
            let mut st = self.inner.state.lock().await;
            st.current_model = None;
            st.status = RunnerStatus::Idle;
            st.child.take()
        };
        if let Some(child) = child {
            child.stop(Duration::ZERO).await;
        }
    }

    /// Control API: load the runner's default model.
    pub async fn control_start(&self) -> Result<(), RunnerError> {
        let _guard = self
            .inner
            .control_lock
            .try_lock()
            .map_err(|_| RunnerError::Busy(self.inner.id.clone()))?;
        let alias = self
            .default_model_alias()
            .ok_or_else(|| RunnerError::NoModels(self.inner.id.clone()))?;
        self.ensure_loaded(&alias).await
    }

    /// Control API: drain and stop.
    pub async fn control_stop(&self) -> Result<(), RunnerError> {
        let _guard = self
            .inner
            .control_lock
            .try_lock()
            .map_err(|_| RunnerError::Busy(self.inner.id.clone()))?;
        self.unload().await;
        Ok(())
    }

    /// Control API: drain, stop, then reload the model that was running
    /// (or the default when none was).
    pub async fn control_restart(&self) -> Result<(), RunnerError> {
        let _guard = self
            .inner
            .control_lock
            .try_lock()
            .map_err(|_| RunnerError::Busy(self.inner.id.clone()))?;
        let target = match self.current_model().await {
            Some(alias) => alias,
            None => self
                .default_model_alias()
                .ok_or_else(|| RunnerError::NoModels(self.inner.id.clone()))?,
        };
        self.unload().await;
        self.ensure_loaded(&target).await
    }
}

/// Tracks one in-flight request; dropping it releases the slot and wakes
/// any drain waiting on the runner.
pub struct RequestPermit {
    inner: Arc<RunnerInner>,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.touch_activity();
        gauge!("flexllama_in_flight", "runner" => self.inner.id.clone())
            .set(prev.saturating_sub(1) as f64);
        if prev == 1 {
            self.inner.in_flight_changed.notify_waiters();
        }
    }
}

async fn wait_for_drain(inner: &RunnerInner) {
    loop {
        if inner.in_flight.load(Ordering::SeqCst) == 0 {
            return;
        }
        let notified = inner.in_flight_changed.notified();
        if inner.in_flight.load(Ordering::SeqCst) == 0 {
            return;
        }
        notified.await;
    }
}

async fn unload_locked(inner: &RunnerInner) {
    inner.draining.store(true, Ordering::SeqCst);
    wait_for_drain(inner).await;

    let old = {
        let mut st = inner.state.lock().await;
        let from = st.current_model.take();
        let child = st.child.take();
        st.status = if child.is_some() {
            RunnerStatus::Stopping
        } else {
            RunnerStatus::Idle
        };
        child.map(|c| (c, from))
    };

    if let Some((child, from)) = old {
        info!(runner = %inner.id, model = ?from, "Unloading model");
        child.stop(STOP_GRACE).await;
        let mut st = inner.state.lock().await;
        st.status = RunnerStatus::Idle;
    }

    inner.draining.store(false, Ordering::SeqCst);
}

/// The serialized swap: drain, stop the old process, spawn the new one, wait
/// for its port. Runs with the load lock held for its entire duration.
async fn swap(
    inner: Arc<RunnerInner>,
    _guard: OwnedMutexGuard<()>,
    alias: String,
) -> Result<(), RunnerError> {
    let Some(model) = inner.models.iter().find(|m| m.alias() == alias).cloned() else {
        return Err(RunnerError::UnknownModel {
            runner: inner.id.clone(),
            model: alias,
        });
    };

    let swap_start = Instant::now();
    inner.draining.store(true, Ordering::SeqCst);
    wait_for_drain(&inner).await;

    let old = {
        let mut st = inner.state.lock().await;
        let from = st.current_model.take();
        let child = st.child.take();
        if child.is_some() {
            st.status = RunnerStatus::Stopping;
        }
        child.map(|c| (c, from))
    };
    if let Some((child, from)) = old {
        info!(runner = %inner.id, from = ?from, to = %alias, "Swapping model");
        child.stop(STOP_GRACE).await;
        counter!("flexllama_swaps_total", "runner" => inner.id.clone()).increment(1);
    }

    {
        let mut st = inner.state.lock().await;
        st.status = RunnerStatus::Launching;
        st.current_model = Some(alias.clone());
        st.last_error = None;
    }

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let args = model.launch_args(&inner.host, inner.config.port, &inner.config.extra_args);
    let (inherit_env, env) = model.compose_env(&inner.config);
    let spec = SpawnSpec {
        binary: inner.config.binary(),
        args: &args,
        inherit_env,
        env: &env,
    };

    let child = match ChildHandle::spawn(&inner.id, &alias, generation, &spec, &inner.log_path) {
        Ok(child) => child,
        Err(e) => return fail_load(&inner, &alias, e.to_string()).await,
    };
    {
        let mut st = inner.state.lock().await;
        st.child = Some(child);
    }

    let deadline = Instant::now() + Duration::from_secs(inner.config.launch_timeout_seconds);
    loop {
        if process::port_accepts(&inner.host, inner.config.port).await {
            break;
        }

        {
            let mut st = inner.state.lock().await;
            if let Some(child) = st.child.as_mut()
                && let Some(status) = child.exit_status()
            {
                st.child = None;
                drop(st);
                return fail_load(&inner, &alias, format!("process exited with {status}")).await;
            }
        }

        if Instant::now() >= deadline {
            let child = inner.state.lock().await.child.take();
            if let Some(child) = child {
                child.stop(STOP_GRACE).await;
            }
            return fail_load(
                &inner,
                &alias,
                format!(
                    "port {}:{} did not accept connections within {}s",
                    inner.host, inner.config.port, inner.config.launch_timeout_seconds
                ),
            )
            .await;
        }

        tokio::time::sleep(process::probe_interval()).await;
    }

    {
        let mut st = inner.state.lock().await;
        st.status = RunnerStatus::Ready;
    }
    inner.draining.store(false, Ordering::SeqCst);
    inner.touch_activity();

    histogram!("flexllama_load_duration_seconds", "runner" => inner.id.clone())
        .record(swap_start.elapsed().as_secs_f64());
    info!(
        runner = %inner.id,
        model = %alias,
        elapsed_ms = swap_start.elapsed().as_millis(),
        "Model is ready"
    );
    Ok(())
}

async fn fail_load(inner: &RunnerInner, alias: &str, reason: String) -> Result<(), RunnerError> {
    error!(runner = %inner.id, model = %alias, reason = %reason, "Model load failed");
    {
        let mut st = inner.state.lock().await;
        st.child = None;
        st.current_model = None;
        st.status = RunnerStatus::Failed;
        st.last_error = Some(reason.clone());
    }
    inner.draining.store(false, Ordering::SeqCst);
    counter!("flexllama_load_failures_total", "runner" => inner.id.clone()).increment(1);
    Err(RunnerError::Load {
        runner: inner.id.clone(),
        model: alias.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, RunnerConfig};

    fn test_runner() -> Runner {
        let config = RunnerConfig {
            port: 9001,
            ..RunnerConfig::default()
        };
        let models = vec![
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
        ];
        Runner::new(
            "r1".to_string(),
            config,
            "127.0.0.1".to_string(),
            models,
            std::env::temp_dir().as_path(),
        )
    }

    async fn force_ready(runner: &Runner, alias: &str) {
        let mut st = runner.inner.state.lock().await;
        st.status = RunnerStatus::Ready;
        st.current_model = Some(alias.to_string());
    }

    #[tokio::test]
    async fn model_assignment_lookup() {
        let runner = test_runner();
        assert!(runner.has_model("model-a"));
        assert!(runner.has_model("model-b"));
        assert!(!runner.has_model("model-c"));
        assert_eq!(runner.default_model_alias().as_deref(), Some("model-a"));
    }

    #[tokio::test]
    async fn ensure_loaded_rejects_unassigned_model() {
        let runner = test_runner();
        let err = runner.ensure_loaded("model-c").await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownModel { .. }));
    }

    #[tokio::test]
    async fn acquire_requires_ready_state() {
        let runner = test_runner();
        assert!(runner.acquire("model-a").await.is_none());
        assert_eq!(runner.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn acquire_requires_matching_alias() {
        let runner = test_runner();
        force_ready(&runner, "model-a").await;

        assert!(runner.acquire("model-b").await.is_none());
        assert_eq!(runner.in_flight_count(), 0);

        let permit = runner.acquire("model-a").await;
        assert!(permit.is_some());
        assert_eq!(runner.in_flight_count(), 1);
        drop(permit);
        assert_eq!(runner.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn acquire_rejected_while_draining() {
        let runner = test_runner();
        force_ready(&runner, "model-a").await;

        runner.inner.draining.store(true, Ordering::SeqCst);
        assert!(runner.acquire("model-a").await.is_none());
        assert_eq!(runner.in_flight_count(), 0);

        runner.inner.draining.store(false, Ordering::SeqCst);
        assert!(runner.acquire("model-a").await.is_some());
    }

    #[tokio::test]
    async fn drain_wakes_when_last_permit_drops() {
        let runner = test_runner();
        force_ready(&runner, "model-a").await;

        let permit = runner.acquire("model-a").await.unwrap();
        let inner = Arc::clone(&runner.inner);
        let drain = tokio::spawn(async move { wait_for_drain(&inner).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("drain should complete after last permit drops")
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_reports_countdown_only_when_ready() {
        let config = RunnerConfig {
            port: 9001,
            auto_unload_timeout_seconds: 300,
            ..RunnerConfig::default()
        };
        let runner = Runner::new(
            "r1".to_string(),
            config,
            "127.0.0.1".to_string(),
            vec![],
            std::env::temp_dir().as_path(),
        );

        assert!(
            runner
                .snapshot()
                .await
                .auto_unload_countdown_seconds
                .is_none()
        );

        {
            let mut st = runner.inner.state.lock().await;
            st.status = RunnerStatus::Ready;
        }
        runner.inner.touch_activity();
        let countdown = runner
            .snapshot()
            .await
            .auto_unload_countdown_seconds
            .unwrap();
        assert!(countdown <= 300 && countdown >= 298);
    }

    #[tokio::test]
    async fn unload_is_idempotent_without_process() {
        let runner = test_runner();
        runner.unload().await;
        runner.unload().await;
        assert_eq!(runner.status().await, RunnerStatus::Idle);
        assert_eq!(runner.current_model().await, None);
    }

    #[tokio::test]
    async fn control_ops_conflict_yields_busy() {
        let runner = test_runner();
        let _guard = runner.inner.control_lock.try_lock().unwrap();
        let err = runner.control_stop().await.unwrap_err();
        assert!(matches!(err, RunnerError::Busy(_)));
    }
}
