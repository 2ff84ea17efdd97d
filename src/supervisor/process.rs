//! Process Supervisor - owns the one OS handle of the supervised server
//!
//! `stop()` and `kill()` always converge to "no handle held": the lifecycle state
//! machine relies on that to make forward progress even when the server process
//! refuses to exit.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Mutex;

use super::error::ProcError;
use crate::config::ConfigError;
use crate::process_monitor::{pid_state_async, PidState};

/// Command written to the server console to request a graceful shutdown.
pub const STOP_COMMAND: &str = "/stop";

#[async_trait]
pub trait ServerProcess: Send + Sync {
    /// Launches the server. Fails if a handle is already held or the OS refuses.
    async fn start(&self) -> Result<(), ProcError>;

    /// Whether a handle is held and the process has not exited.
    async fn alive(&self) -> bool;

    /// Graceful stop with a forced fallback. Only fails if nothing was started.
    async fn stop(&self) -> Result<(), ProcError>;

    /// Forced termination. No-op without a live handle.
    async fn kill(&self);
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
}

/// [`ServerProcess`] backed by a `tokio::process::Child`.
///
/// The handle mutex is held for the whole of each operation, so concurrent
/// start/stop/kill calls are serialized.
pub struct ChildProcess {
    spec: ProcessSpec,
    timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ChildProcess {
    pub fn new(spec: ProcessSpec, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Process timeout must be greater than zero".to_string(),
            ));
        }
        if spec.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Process executable must not be empty".to_string(),
            ));
        }
        Ok(Self {
            spec,
            timeout,
            child: Mutex::new(None),
        })
    }

    /// PID of the held process, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    async fn kill_locked(&self, slot: &mut Option<Child>) {
        let Some(child) = slot.as_mut() else {
            return;
        };

        if !matches!(child.try_wait(), Ok(None)) {
            *slot = None;
            return;
        }

        let pid = child.id();
        if let Err(e) = child.start_kill() {
            tracing::error!(?pid, "Error killing server process: {}", e);
        }

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => tracing::info!(?pid, "Server process killed ({})", status),
            Ok(Err(e)) => tracing::error!(?pid, "Error waiting for killed server process: {}", e),
            Err(_) => {
                let state = match pid {
                    Some(pid) => pid_state_async(pid).await,
                    None => PidState::Gone,
                };
                tracing::error!(
                    ?pid,
                    ?state,
                    "Server process did not confirm exit after kill: possible zombie process, check immediately"
                );
            }
        }

        *slot = None;
    }
}

#[async_trait]
impl ServerProcess for ChildProcess {
    async fn start(&self) -> Result<(), ProcError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_ref() {
            return Err(ProcError::AlreadyRunning(child.id()));
        }

        let mut cmd = crate::utils::server_command(
            &self.spec.program,
            &self.spec.args,
            self.spec.working_dir.as_deref(),
        );
        let child = cmd.spawn().map_err(|source| ProcError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;

        tracing::info!(pid = ?child.id(), "Server process started: {}", self.spec.program);
        *slot = Some(child);
        Ok(())
    }

    async fn alive(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn stop(&self) -> Result<(), ProcError> {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return Err(ProcError::NotRunning);
        };

        if !matches!(child.try_wait(), Ok(None)) {
            *slot = None;
            return Ok(());
        }

        let pid = child.id();
        // closing stdin after the command mirrors a console "communicate"
        match child.stdin.take() {
            Some(mut stdin) => {
                let line = format!("{}\n", STOP_COMMAND);
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                };
                match tokio::time::timeout(self.timeout, write).await {
                    Ok(Ok(())) => tracing::info!(?pid, "Stop command sent to server process"),
                    Ok(Err(e)) => tracing::error!(?pid, "Error sending stop command: {}", e),
                    Err(_) => tracing::warn!(?pid, "Timeout reached sending stop command"),
                }
            }
            None => tracing::warn!(?pid, "Server process stdin is unavailable"),
        }

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                tracing::info!(?pid, "Server process stopped ({})", status);
                *slot = None;
            }
            Ok(Err(e)) => {
                tracing::warn!(?pid, "Error while waiting for server process to stop: {}", e);
                tracing::warn!(?pid, "Killing server process...");
                self.kill_locked(&mut slot).await;
            }
            Err(_) => {
                tracing::warn!(?pid, "Timeout reached waiting for server process to stop");
                tracing::warn!(?pid, "Killing server process...");
                self.kill_locked(&mut slot).await;
            }
        }

        Ok(())
    }

    async fn kill(&self) {
        let mut slot = self.child.lock().await;
        self.kill_locked(&mut slot).await;
    }
}
