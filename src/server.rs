//! One supervised server: event bus, lifecycle controller, idle/health monitor and
//! command gateway wired together, plus the control surface exposed upward.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, GlobalConfig};
use crate::conn::{ConnError, ServerConn, SocketConn};
use crate::controller::ServerController;
use crate::event::history::{EventHistory, DEFAULT_HISTORY};
use crate::event::{logger, EventBus, ServerEvent};
use crate::monitor::ServerMonitor;
use crate::protocol::gateway::{CommandError, CommandGateway, RconConsole, RemoteConsole};
use crate::supervisor::{ChildProcess, ProcessSpec, ServerProcess, ServerStatus};

/// Timing and command policy for one server.
#[derive(Debug, Clone)]
pub struct Settings {
    pub startup_timeout: Duration,
    /// `None` disables idle shutdown
    pub idle_timeout: Option<Duration>,
    pub polling_interval: Duration,
    pub max_command_len: usize,
    pub banned_commands: Vec<String>,
}

impl Settings {
    pub fn from_config(cfg: &GlobalConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            startup_timeout: cfg.startup_timeout()?,
            idle_timeout: cfg.idle_timeout()?,
            polling_interval: cfg.polling_interval()?,
            max_command_len: cfg.rcon.max_command_len,
            banned_commands: cfg.rcon.banned_commands.clone(),
        })
    }
}

pub struct Server {
    bus: Arc<EventBus>,
    conn: Arc<dyn ServerConn>,
    controller: Arc<ServerController>,
    monitor: Arc<ServerMonitor>,
    gateway: CommandGateway,
    history: Arc<EventHistory>,
}

impl Server {
    /// Builds the production server: socket table, child process, RCON.
    pub fn from_config(cfg: &GlobalConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let executable = cfg
            .process
            .executable
            .clone()
            .ok_or_else(|| ConfigError::Invalid("process.executable is required".to_string()))?;

        let conn = Arc::new(SocketConn::new(cfg.server.port));
        let process = Arc::new(ChildProcess::new(
            ProcessSpec {
                program: executable,
                args: cfg.process.args.clone(),
                working_dir: cfg.process.working_dir.clone(),
            },
            cfg.process_timeout()?,
        )?);
        let console = Arc::new(RconConsole::new(
            cfg.rcon.port,
            cfg.rcon.password.clone(),
            cfg.rcon_timeout()?,
        )?);

        tracing::info!(
            port = cfg.server.port,
            rcon_port = cfg.rcon.port,
            "Supervising server: {}",
            cfg.process.executable.as_deref().unwrap_or_default()
        );
        Self::assemble(conn, process, console, Settings::from_config(cfg)?)
    }

    /// Wires the components around the given collaborators.
    pub fn assemble(
        conn: Arc<dyn ServerConn>,
        process: Arc<dyn ServerProcess>,
        console: Arc<dyn RemoteConsole>,
        settings: Settings,
    ) -> Result<Self, ConfigError> {
        let bus = Arc::new(EventBus::new());
        // observers first, so they see each event before the reactions it triggers
        logger::attach(&bus);
        let history = EventHistory::attach(&bus, DEFAULT_HISTORY);

        let controller =
            ServerController::new(conn.clone(), process, bus.clone(), settings.startup_timeout)?;
        let monitor = ServerMonitor::new(
            conn.clone(),
            bus.clone(),
            controller.watch_status(),
            settings.idle_timeout,
            settings.polling_interval,
        )?;
        let gateway = CommandGateway::new(console, settings.max_command_len, &settings.banned_commands)?;

        Ok(Self {
            bus,
            conn,
            controller,
            monitor,
            gateway,
            history,
        })
    }

    pub fn status(&self) -> ServerStatus {
        self.controller.status()
    }

    pub async fn try_open(&self) -> bool {
        self.controller.try_open().await
    }

    pub async fn try_close(&self) -> bool {
        self.controller.try_close().await
    }

    pub async fn try_restart(&self) -> bool {
        self.controller.try_restart().await
    }

    /// Remaining idle budget before an automatic close.
    pub fn timeout_in(&self) -> Option<Duration> {
        self.monitor.timeout_in()
    }

    /// Connected players, or an error when the socket table cannot be read.
    pub fn client_count(&self) -> Result<usize, ConnError> {
        self.conn.client_count()
    }

    /// Runs a console command. Only allowed while the server is open.
    pub async fn execute(&self, command: &str) -> Result<String, CommandError> {
        let status = self.status();
        if status != ServerStatus::Open {
            return Err(CommandError::NotOpen(status));
        }
        self.gateway.execute(command).await
    }

    /// Adds a handler for lifecycle notifications.
    pub fn subscribe<F, Fut>(&self, event: ServerEvent, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus.subscribe(event, handler);
    }

    pub fn history(&self) -> &Arc<EventHistory> {
        &self.history
    }

    /// Brings the server down and stops monitoring. Further opens are refused.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        self.monitor.stop();
        tracing::info!(status = %self.status(), "Server supervisor shut down");
    }
}
