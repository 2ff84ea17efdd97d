//! Local HTTP control surface for presentation layers (chat bots, dashboards).

mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::event::history::EventRecord;
use crate::server::Server;
use crate::supervisor::ServerStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ServerStatus,
    /// `None` when the socket table could not be read
    pub client_count: Option<usize>,
    /// Seconds left before the idle server is closed
    pub idle_timeout_in: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsQuery {
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<EventRecord>,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub server: Arc<Server>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(server: Arc<Server>, listen_addr: &str) -> Self {
        Self {
            server,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/server/status", get(handlers::server::get_status))
            .route("/api/server/open", post(handlers::server::open_server))
            .route("/api/server/close", post(handlers::server::close_server))
            .route("/api/server/restart", post(handlers::server::restart_server))
            .route("/api/server/command", post(handlers::server::execute_command))
            .route("/api/server/events", get(handlers::server::list_events))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}
