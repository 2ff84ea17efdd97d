//! Lifecycle Controller - the one owner of [`ServerStatus`]
//!
//! ```text
//! Closed --try_open--> Opening --port listening--> Open --try_close--> Closing --> Closed
//!                         |
//!                         +--launch failed / Hung / shutdown--> Closed
//! ```
//!
//! Every transition is a check-and-set under the status lock, so concurrent callers
//! cannot both win the same transition. The lock is never held across an await.
//! Each transition is also published on a `watch` channel for observers that must
//! not act on a stale event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::conn::ServerConn;
use crate::event::{EventBus, ServerEvent};
use crate::supervisor::{ServerProcess, ServerStatus, StateMachine};

pub struct ServerController {
    state: Mutex<StateMachine>,
    status_tx: watch::Sender<ServerStatus>,
    conn: Arc<dyn ServerConn>,
    process: Arc<dyn ServerProcess>,
    bus: Arc<EventBus>,
    startup_timeout: Duration,
    shutdown: CancellationToken,
}

impl ServerController {
    /// Builds the controller and subscribes it to `Idle` (close) and `Crashed` (restart).
    pub fn new(
        conn: Arc<dyn ServerConn>,
        process: Arc<dyn ServerProcess>,
        bus: Arc<EventBus>,
        startup_timeout: Duration,
    ) -> Result<Arc<Self>, ConfigError> {
        if startup_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Startup timeout must be greater than zero".to_string(),
            ));
        }

        let state = StateMachine::new();
        let (status_tx, _) = watch::channel(state.state());
        let controller = Arc::new(Self {
            state: Mutex::new(state),
            status_tx,
            conn,
            process,
            bus: bus.clone(),
            startup_timeout,
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&controller);
        bus.subscribe(ServerEvent::Idle, move || on_idle(weak.clone()));
        let weak = Arc::downgrade(&controller);
        bus.subscribe(ServerEvent::Crashed, move || on_crashed(weak.clone()));

        Ok(controller)
    }

    fn state(&self) -> MutexGuard<'_, StateMachine> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, from: ServerStatus, to: ServerStatus) -> bool {
        let mut state = self.state();
        if !state.transition_from(from, to) {
            return false;
        }
        // published before the lock is released, so watchers never lag a finished transition
        self.status_tx.send_replace(to);
        true
    }

    pub fn status(&self) -> ServerStatus {
        self.state().state()
    }

    /// Follows every status transition.
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    async fn publish(&self, event: ServerEvent) {
        if let Err(e) = self.bus.emit(event).await {
            tracing::error!(%event, "Failed to emit event: {}", e);
        }
    }

    /// Launches the server if it is closed. Returns once the process is started,
    /// without waiting for the port to open.
    pub async fn try_open(self: &Arc<Self>) -> bool {
        if self.shutdown.is_cancelled() {
            tracing::warn!("Controller is shut down, refusing to open");
            return false;
        }
        if !self.advance(ServerStatus::Closed, ServerStatus::Opening) {
            return false;
        }
        self.publish(ServerEvent::Opening).await;

        if let Err(e) = self.process.start().await {
            tracing::error!("Failed to start server: {}", e);
            self.advance(ServerStatus::Opening, ServerStatus::Closed);
            return false;
        }

        // shutdown may have run while the process was launching
        if self.shutdown.is_cancelled() {
            tracing::warn!("Controller shut down during launch, killing the server");
            self.process.kill().await;
            if self.advance(ServerStatus::Opening, ServerStatus::Closed) {
                self.publish(ServerEvent::Closed).await;
            }
            return false;
        }

        let this = self.clone();
        tokio::spawn(async move { this.track_startup().await });
        true
    }

    async fn track_startup(self: Arc<Self>) {
        let opened = select! {
            res = self.conn.wait_open(Some(self.startup_timeout)) => res,
            _ = self.shutdown.cancelled() => {
                tracing::debug!("Startup tracking cancelled");
                return;
            }
        };

        match opened {
            Ok(()) => {
                if self.advance(ServerStatus::Opening, ServerStatus::Open) {
                    self.publish(ServerEvent::Opened).await;
                }
            }
            Err(_) => {
                tracing::error!(
                    timeout = ?self.startup_timeout,
                    "Server port did not open in time, killing the process"
                );
                self.process.kill().await;
                if self.advance(ServerStatus::Opening, ServerStatus::Closed) {
                    self.publish(ServerEvent::Hung).await;
                }
            }
        }
    }

    /// Stops the server if it is open. Always reaches `Closed` from `Open`.
    pub async fn try_close(&self) -> bool {
        if !self.advance(ServerStatus::Open, ServerStatus::Closing) {
            return false;
        }
        self.publish(ServerEvent::Closing).await;

        if let Err(e) = self.process.stop().await {
            tracing::warn!("Error while stopping server: {}", e);
        }

        self.advance(ServerStatus::Closing, ServerStatus::Closed);
        self.publish(ServerEvent::Closed).await;
        true
    }

    pub async fn try_restart(self: &Arc<Self>) -> bool {
        self.try_close().await && self.try_open().await
    }

    /// Cancels startup tracking and brings the server down for good.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if self.advance(ServerStatus::Opening, ServerStatus::Closed) {
            tracing::info!("Shutting down while the server is starting, killing it");
            self.process.kill().await;
            self.publish(ServerEvent::Closed).await;
        } else if self.status() == ServerStatus::Open {
            self.try_close().await;
        }
    }
}

async fn on_idle(controller: Weak<ServerController>) -> anyhow::Result<()> {
    if let Some(controller) = controller.upgrade() {
        if !controller.try_close().await {
            tracing::debug!(status = %controller.status(), "Idle ignored, server is not open");
        }
    }
    Ok(())
}

async fn on_crashed(controller: Weak<ServerController>) -> anyhow::Result<()> {
    if let Some(controller) = controller.upgrade() {
        if !controller.try_restart().await {
            tracing::error!(status = %controller.status(), "Failed to restart crashed server");
        }
    }
    Ok(())
}
