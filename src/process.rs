//! Child-process supervision for runner slots.
//!
//! A [`ChildHandle`] owns exactly one spawned llama-server process: it
//! composes stdio capture, forwards output lines as tracing events under the
//! `llama` target (enable with e.g. `RUST_LOG=info,llama=debug`), appends them
//! to a per-runner log file, and knows how to stop the whole process group
//! with SIGTERM → SIGKILL escalation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Rotate a runner log once it grows past this size.
const MAX_LOG_BYTES: u64 = 16 * 1024 * 1024;

/// Per-probe connect timeout while waiting for a child's port.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between port probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("failed to open log sink {path}: {source}")]
    LogSink {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Strip ANSI escape sequences from a line of child output.
pub(crate) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Append-only log file with size-based rotation to `<name>.1`.
struct LogSink {
    path: PathBuf,
    file: std::fs::File,
    written: u64,
}

impl LogSink {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
        })
    }

    fn write_line(&mut self, line: &str) {
        if self.written > MAX_LOG_BYTES {
            self.rotate();
        }
        if writeln!(self.file, "{line}").is_ok() {
            self.written += line.len() as u64 + 1;
        }
    }

    fn rotate(&mut self) {
        let backup = self.path.with_extension("log.1");
        let _ = std::fs::remove_file(&backup);
        if let Err(e) = std::fs::rename(&self.path, &backup) {
            warn!(path = %self.path.display(), error = %e, "Failed to rotate log file");
            return;
        }
        match LogSink::open(&self.path) {
            Ok(fresh) => *self = fresh,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to reopen log file after rotation");
            }
        }
    }
}

/// Everything needed to launch one child process.
pub struct SpawnSpec<'a> {
    pub binary: &'a str,
    pub args: &'a [String],
    /// Start from the parent environment when true, empty otherwise
    pub inherit_env: bool,
    pub env: &'a [(String, String)],
}

/// Handle to one running llama-server process.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    pid: Option<u32>,
}

impl ChildHandle {
    /// Spawn the process in its own process group, wiring stdout/stderr into
    /// the runner's log file and tracing. Returns once the process exists;
    /// readiness is the caller's concern.
    pub fn spawn(
        runner_id: &str,
        model_alias: &str,
        generation: u64,
        spec: &SpawnSpec<'_>,
        log_path: &Path,
    ) -> Result<Self, ProcessError> {
        let sink = LogSink::open(log_path).map_err(|source| ProcessError::LogSink {
            path: log_path.to_path_buf(),
            source,
        })?;
        let sink = Arc::new(Mutex::new(sink));

        if let Ok(mut s) = sink.lock() {
            s.write_line(&format!(
                "=== generation {generation}: starting model {model_alias} ==="
            ));
        }

        let mut cmd = Command::new(spec.binary);
        cmd.args(spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if !spec.inherit_env {
            cmd.env_clear();
        }
        for (key, value) in spec.env {
            cmd.env(key, value);
        }

        // Spawn in its own process group so stop() can take down the whole
        // tree (llama-server may fork worker processes).
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            binary: spec.binary.to_string(),
            source,
        })?;

        let pid = child.id();
        info!(
            runner = %runner_id,
            model = %model_alias,
            pid = ?pid,
            binary = %spec.binary,
            "Spawned runner process"
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, runner_id.to_string(), "stdout", Arc::clone(&sink));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, runner_id.to_string(), "stderr", sink);
        }

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// The exit status if the process has already terminated.
    pub fn exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Stop the process group: SIGTERM, wait up to `grace`, then SIGKILL.
    /// Always reaps the child before returning. Idempotent.
    pub async fn stop(mut self, grace: Duration) {
        if self.child.try_wait().ok().flatten().is_some() {
            return;
        }

        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        signal_process_group(pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            warn!(pid, "Process did not exit within grace period, killing");
            #[cfg(unix)]
            signal_process_group(pid, libc::SIGKILL);
            #[cfg(not(unix))]
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }

        debug!(pid, "Process stopped");
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // Backstop against leaking children when a handle is dropped without
        // a clean stop (shutdown races, test teardown).
        if matches!(self.child.try_wait(), Ok(None)) {
            #[cfg(unix)]
            if let Some(pid) = self.child.id() {
                signal_process_group(pid, libc::SIGKILL);
            }
            let _ = self.child.start_kill();
        }
    }
}

/// Send a signal to the child's entire process group.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: libc::c_int) {
    // SAFETY: signalling a process group we spawned.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

fn forward_output<R>(stream: R, runner_id: String, name: &'static str, sink: Arc<Mutex<LogSink>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let clean = strip_ansi(line.trim_end());
            if !clean.is_empty() {
                debug!(target: "llama", runner = %runner_id, stream = name, "{}", clean);
            }
            if let Ok(mut s) = sink.lock() {
                s.write_line(&line);
            }
        }
    });
}

/// One successful TCP connect (then close) against the child's endpoint.
pub async fn port_accepts(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// How long to sleep between port probes.
pub fn probe_interval() -> Duration {
    PROBE_INTERVAL
}

/// Resolve and create the session log directory.
///
/// Base directory comes from `FLEXLLAMA_LOG_DIR` (default `logs`), with a
/// fallback to a per-user temp directory when the preferred base is not
/// writable. Each gateway process gets its own session subdirectory.
pub fn session_log_dir() -> PathBuf {
    let preferred =
        PathBuf::from(std::env::var("FLEXLLAMA_LOG_DIR").unwrap_or_else(|_| "logs".to_string()));

    let base = match std::fs::create_dir_all(&preferred) {
        Ok(()) => preferred,
        Err(e) => {
            let fallback = std::env::temp_dir().join(format!(
                "flexllama_logs_{}",
                std::env::var("USER").unwrap_or_else(|_| "user".to_string())
            ));
            warn!(
                preferred = %preferred.display(),
                fallback = %fallback.display(),
                error = %e,
                "Log directory not writable, falling back"
            );
            let _ = std::fs::create_dir_all(&fallback);
            fallback
        }
    };

    let epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let session = base.join(format!("session_{}_{}", epoch_secs, std::process::id()));
    if let Err(e) = std::fs::create_dir_all(&session) {
        warn!(path = %session.display(), error = %e, "Failed to create session log directory");
        return base;
    }
    session
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_sequences() {
        assert_eq!(strip_ansi("hello"), "hello");
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(
            strip_ansi("\x1b[1;32mgreen bold\x1b[0m text"),
            "green bold text"
        );
    }

    #[test]
    fn log_sink_appends_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner1.log");

        let mut sink = LogSink::open(&path).unwrap();
        sink.write_line("=== generation 1: starting model m1 ===");
        sink.write_line("hello");
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("generation 1"));
        assert!(contents.contains("hello"));

        // Reopen appends rather than truncating.
        let mut sink = LogSink::open(&path).unwrap();
        sink.write_line("world");
        drop(sink);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("world"));

        // Force a rotation by pretending the file is oversized.
        let mut sink = LogSink::open(&path).unwrap();
        sink.written = MAX_LOG_BYTES + 1;
        sink.write_line("post-rotation");
        drop(sink);

        let backup = path.with_extension("log.1");
        assert!(backup.exists());
        let fresh = std::fs::read_to_string(&path).unwrap();
        assert!(fresh.contains("post-rotation"));
        assert!(!fresh.contains("hello"));
    }

    #[tokio::test]
    async fn port_probe_fails_on_closed_port() {
        // Bind then drop to get a port that is very likely closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!port_accepts("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn port_probe_succeeds_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_accepts("127.0.0.1", port).await);
    }
}
