//! Command Gateway - validates operator commands before they reach the server console
//!
//! The graceful stop command is always banned so the lifecycle controller stays the
//! only way to shut the server down.

use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use super::rcon::RconClient;
use super::ProtocolError;
use crate::config::ConfigError;
use crate::supervisor::{ServerStatus, STOP_COMMAND};

/// Host the remote console is reached on; the server always runs locally.
pub const RCON_HOST: &str = "127.0.0.1";

/// Java Edition command names, used to validate the configured banned list.
pub const MINECRAFT_COMMANDS: &[&str] = &[
    "advancement", "attribute", "ban", "ban-ip", "banlist", "bossbar", "clear", "clone",
    "damage", "data", "datapack", "debug", "defaultgamemode", "deop", "difficulty",
    "effect", "enchant", "execute", "experience", "fill", "fillbiome", "forceload",
    "function", "gamemode", "gamerule", "give", "help", "item", "jfr", "kick", "kill",
    "list", "locate", "loot", "me", "msg", "op", "pardon", "pardon-ip", "particle",
    "perf", "place", "playsound", "publish", "random", "recipe", "reload", "return",
    "ride", "save-all", "save-off", "save-on", "say", "schedule", "scoreboard", "seed",
    "setblock", "setidletimeout", "setworldspawn", "spawnpoint", "spectate",
    "spreadplayers", "stop", "stopsound", "summon", "tag", "team", "teammsg", "teleport",
    "tell", "tellraw", "tick", "time", "title", "tm", "tp", "transfer", "trigger", "w",
    "weather", "whitelist", "worldborder", "xp",
];

/// Whether `command` names a Minecraft command. A leading `/` is optional.
pub fn is_known_command(command: &str) -> bool {
    let name = command.trim().trim_start_matches('/').to_lowercase();
    MINECRAFT_COMMANDS.contains(&name.as_str())
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Malformed or banned command. Not worth retrying.
    #[error("Invalid command: {0}")]
    Invalid(String),

    #[error("Server is {0}, commands can only be executed while it is open")]
    NotOpen(ServerStatus),

    #[error("RCON error: {0}")]
    Rcon(#[from] ProtocolError),
}

impl CommandError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::NotOpen(_) => StatusCode::CONFLICT,
            Self::Rcon(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "INVALID_COMMAND",
            Self::NotOpen(_) => "SERVER_NOT_OPEN",
            Self::Rcon(ProtocolError::Auth(_)) => "RCON_AUTH_FAILED",
            Self::Rcon(ProtocolError::Timeout(_)) => "RCON_TIMEOUT",
            Self::Rcon(_) => "RCON_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for CommandError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

/// Something that can run a console command on the server and return its output.
pub trait RemoteConsole: Send + Sync {
    /// Blocking; the gateway calls it off the async runtime.
    fn run(&self, command: &str) -> Result<String, ProtocolError>;
}

/// [`RemoteConsole`] that opens a fresh RCON session per command.
#[derive(Debug, Clone)]
pub struct RconConsole {
    port: u16,
    password: Option<String>,
    timeout: Duration,
}

impl RconConsole {
    pub fn new(port: u16, password: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        if port == 0 {
            return Err(ConfigError::Invalid("RCON port outside valid range".to_string()));
        }
        if timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "RCON timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            port,
            password,
            timeout,
        })
    }
}

impl RemoteConsole for RconConsole {
    fn run(&self, command: &str) -> Result<String, ProtocolError> {
        let password = self.password.as_deref().unwrap_or_default();
        let mut client = RconClient::connect(RCON_HOST, self.port, password, self.timeout)?;
        client.execute(command)
    }
}

pub struct CommandGateway {
    console: Arc<dyn RemoteConsole>,
    max_len: usize,
    banned: Vec<String>,
}

impl CommandGateway {
    /// `banned` entries must be Minecraft commands; the stop command is always added.
    pub fn new(
        console: Arc<dyn RemoteConsole>,
        max_len: usize,
        banned: &[String],
    ) -> Result<Self, ConfigError> {
        if max_len == 0 {
            return Err(ConfigError::Invalid(
                "Maximum command length must be greater than zero".to_string(),
            ));
        }
        if let Some(unknown) = banned.iter().find(|c| !is_known_command(c)) {
            return Err(ConfigError::Invalid(format!(
                "Invalid minecraft command provided on banned commands: {}",
                unknown
            )));
        }

        let mut banned: Vec<String> = banned.iter().map(|c| c.trim().to_lowercase()).collect();
        banned.push(STOP_COMMAND.to_string());
        banned.dedup();

        Ok(Self {
            console,
            max_len,
            banned,
        })
    }

    pub fn banned(&self) -> &[String] {
        &self.banned
    }

    fn validate(&self, command: &str) -> Result<(), CommandError> {
        if command.trim().is_empty() {
            return Err(CommandError::Invalid("The command is empty".to_string()));
        }
        if command.chars().count() > self.max_len {
            return Err(CommandError::Invalid(format!(
                "The command is too long (max {} characters)",
                self.max_len
            )));
        }

        let lowered = command.to_lowercase();
        if let Some(banned) = self.banned.iter().find(|b| lowered.contains(b.as_str())) {
            return Err(CommandError::Invalid(format!("Command {} is not allowed", banned)));
        }
        Ok(())
    }

    /// Validates `command` and forwards it verbatim to the remote console.
    pub async fn execute(&self, command: &str) -> Result<String, CommandError> {
        self.validate(command)?;

        let console = self.console.clone();
        let owned = command.to_string();
        let response = tokio::task::spawn_blocking(move || console.run(&owned))
            .await
            .map_err(|e| ProtocolError::Protocol(format!("RCON task failed: {}", e)))??;

        tracing::info!(command, "Command executed");
        Ok(response)
    }
}
