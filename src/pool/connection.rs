//! A live tool subprocess and its lifecycle.
//!
//! Spawning, liveness and termination only. The byte stream on stdin/stdout
//! belongs to whoever holds the connection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::PoolConfig;
use crate::types::{ConnectionId, Error, Result, ToolId};

/// How to start a tool process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How a connection's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Process had already exited.
    AlreadyExited,
    /// Exited after the graceful stop request.
    Graceful,
    /// Exited after a force kill.
    Killed,
    /// Still not reaped after the kill timeout. Left to `kill_on_drop`.
    Failed,
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationOutcome::AlreadyExited => "already_exited",
            TerminationOutcome::Graceful => "graceful",
            TerminationOutcome::Killed => "killed",
            TerminationOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A reusable handle to one spawned tool subprocess.
///
/// Held either by the pool (idle) or by exactly one caller (active).
pub struct Connection {
    id: ConnectionId,
    tool_id: ToolId,
    spec: SpawnSpec,
    child: Child,
    pid: Option<u32>,
    created_at: Instant,
    last_used_at: Instant,
    last_health_check_at: Option<Instant>,
    is_healthy: bool,
    use_count: u64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tool_id", &self.tool_id)
            .field("command", &self.spec.command)
            .field("pid", &self.pid)
            .field("is_healthy", &self.is_healthy)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start the process with piped stdio. A process that exits within
    /// `spawn_grace` is reported as a spawn failure.
    pub(crate) async fn spawn(tool_id: &ToolId, spec: &SpawnSpec, config: &PoolConfig) -> Result<Self> {
        let failure = |reason: String| Error::spawn_failure(tool_id.as_str(), spec.command.as_str(), reason);

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let started = async {
            let mut child = command.spawn().map_err(|e| failure(e.to_string()))?;
            // `Child::wait` closes stdin on first poll; hold it aside while waiting.
            let stdin = child.stdin.take();
            match tokio::time::timeout(config.spawn_grace, child.wait()).await {
                Ok(Ok(status)) => Err(failure(format!("exited immediately with {status}"))),
                Ok(Err(e)) => Err(failure(e.to_string())),
                Err(_) => {
                    child.stdin = stdin;
                    Ok(child)
                }
            }
        };
        let child = tokio::time::timeout(config.spawn_timeout, started)
            .await
            .map_err(|_| failure(format!("not started within {:?}", config.spawn_timeout)))??;

        let now = Instant::now();
        let connection = Self {
            id: ConnectionId::new(),
            tool_id: tool_id.clone(),
            spec: spec.clone(),
            pid: child.id(),
            child,
            created_at: now,
            last_used_at: now,
            last_health_check_at: Some(now),
            is_healthy: true,
            use_count: 0,
        };
        tracing::debug!(
            "connection_spawned: tool={}, connection_id={}, pid={:?}",
            connection.tool_id,
            connection.id,
            connection.pid
        );
        Ok(connection)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn tool_id(&self) -> &ToolId {
        &self.tool_id
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn last_health_check_at(&self) -> Option<Instant> {
        self.last_health_check_at
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.child.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> Option<&mut ChildStdout> {
        self.child.stdout.as_mut()
    }

    /// Healthy iff the process is still running. Updates the health flag and
    /// check timestamp.
    pub fn check_health(&mut self) -> bool {
        self.last_health_check_at = Some(Instant::now());
        self.is_healthy = match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(
                    "connection_exited: tool={}, connection_id={}, status={}",
                    self.tool_id,
                    self.id,
                    status
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    "connection_health_check_failed: tool={}, connection_id={}, error={}",
                    self.tool_id,
                    self.id,
                    e
                );
                false
            }
        };
        self.is_healthy
    }

    pub(crate) fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn health_check_due(&self, interval: Duration) -> bool {
        self.last_health_check_at
            .map_or(true, |at| at.elapsed() >= interval)
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Two-phase stop: close stdin and send SIGTERM, wait up to `graceful`,
    /// then force-kill and wait up to `kill`. Never blocks past both bounds.
    pub(crate) async fn terminate(mut self, graceful: Duration, kill: Duration) -> TerminationOutcome {
        if let Ok(Some(_)) = self.child.try_wait() {
            return TerminationOutcome::AlreadyExited;
        }

        drop(self.child.stdin.take());
        if request_stop(self.pid)
            && matches!(
                tokio::time::timeout(graceful, self.child.wait()).await,
                Ok(Ok(_))
            )
        {
            return TerminationOutcome::Graceful;
        }

        tracing::warn!(
            "connection_force_kill: tool={}, connection_id={}, pid={:?}",
            self.tool_id,
            self.id,
            self.pid
        );
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(
                "connection_kill_signal_failed: tool={}, connection_id={}, error={}",
                self.tool_id,
                self.id,
                e
            );
        }
        match tokio::time::timeout(kill, self.child.wait()).await {
            Ok(Ok(_)) => TerminationOutcome::Killed,
            Ok(Err(e)) => {
                tracing::error!(
                    "connection_kill_failed: tool={}, connection_id={}, error={}",
                    self.tool_id,
                    self.id,
                    e
                );
                TerminationOutcome::Failed
            }
            Err(_) => {
                tracing::error!(
                    "connection_kill_timeout: tool={}, connection_id={}, pid={:?}",
                    self.tool_id,
                    self.id,
                    self.pid
                );
                TerminationOutcome::Failed
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(pid: Option<u32>) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn request_stop(_pid: Option<u32>) -> bool {
    false
}
