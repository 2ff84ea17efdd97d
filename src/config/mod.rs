use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::gateway::is_known_command;

pub const DEFAULT_CONFIG_PATH: &str = "config/daemon.toml";
pub const ENV_CONFIG: &str = "MCD_CONFIG";
pub const ENV_PROCESS_EXECUTABLE: &str = "MCD_PROCESS_EXECUTABLE";
pub const ENV_RCON_PASSWORD: &str = "MCD_RCON_PASSWORD";
pub const ENV_IPC_ADDR: &str = "MCD_IPC_ADDR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub process: ProcessConfig,
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub rcon: RconConfig,
    pub ipc: IpcConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ProcessConfig {
    /// Server launch script or executable. Required to open the server.
    pub executable: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Budget for each of: stop acknowledgement, exit after kill
    pub timeout_secs: f64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            timeout_secs: 4.0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub startup_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 25565,
            startup_timeout_secs: 120.0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub idle_enabled: bool,
    pub idle_timeout_secs: f64,
    pub polling_interval_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_enabled: true,
            idle_timeout_secs: 300.0,
            polling_interval_secs: 60.0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RconConfig {
    pub port: u16,
    pub password: Option<String>,
    pub timeout_secs: f64,
    pub max_command_len: usize,
    pub banned_commands: Vec<String>,
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            port: 25575,
            password: None,
            timeout_secs: 16.0,
            max_command_len: 256,
            banned_commands: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IpcConfig {
    pub listen_addr: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:57475".to_string(),
        }
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{} must be greater than zero (got {})",
            name, value
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConfigError::Invalid(format!("{} is out of range: {}", name, e)))
}

fn port(name: &str, value: u16) -> Result<u16, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} outside valid range", name)));
    }
    Ok(value)
}

impl GlobalConfig {
    /// Loads `$MCD_CONFIG` (or `config/daemon.toml`), then applies env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads a TOML file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config file {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(executable) = var(ENV_PROCESS_EXECUTABLE) {
            self.process.executable = Some(executable);
        }
        if let Some(password) = var(ENV_RCON_PASSWORD) {
            self.rcon.password = Some(password);
        }
        if let Some(addr) = var(ENV_IPC_ADDR) {
            self.ipc.listen_addr = addr;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.process_timeout()?;
        self.startup_timeout()?;
        self.idle_timeout()?;
        self.polling_interval()?;
        self.rcon_timeout()?;
        port("server.port", self.server.port)?;
        port("rcon.port", self.rcon.port)?;

        if self.rcon.max_command_len == 0 {
            return Err(ConfigError::Invalid(
                "rcon.max_command_len must be greater than zero".to_string(),
            ));
        }
        if let Some(unknown) = self.rcon.banned_commands.iter().find(|c| !is_known_command(c)) {
            return Err(ConfigError::Invalid(format!(
                "Invalid minecraft command provided on banned commands: {}",
                unknown
            )));
        }
        if self.ipc.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "ipc.listen_addr is not a socket address: {}",
                self.ipc.listen_addr
            )));
        }
        Ok(())
    }

    pub fn process_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("process.timeout_secs", self.process.timeout_secs)
    }

    pub fn startup_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("server.startup_timeout_secs", self.server.startup_timeout_secs)
    }

    /// `None` when idle shutdown is disabled. A zero timeout means the default.
    pub fn idle_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        if !self.monitor.idle_enabled {
            return Ok(None);
        }
        let secs = if self.monitor.idle_timeout_secs == 0.0 {
            MonitorConfig::default().idle_timeout_secs
        } else {
            self.monitor.idle_timeout_secs
        };
        seconds("monitor.idle_timeout_secs", secs).map(Some)
    }

    pub fn polling_interval(&self) -> Result<Duration, ConfigError> {
        seconds("monitor.polling_interval_secs", self.monitor.polling_interval_secs)
    }

    pub fn rcon_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("rcon.timeout_secs", self.rcon.timeout_secs)
    }
}
