use std::sync::Arc;

use anyhow::Context;
use mc_daemon::config::GlobalConfig;
use mc_daemon::ipc::IPCServer;
use mc_daemon::server::Server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("mc-daemon starting");

    let cfg = GlobalConfig::load().context("Failed to load configuration")?;
    let server = Arc::new(Server::from_config(&cfg).context("Failed to set up the server")?);

    let shutdown = CancellationToken::new();
    let ipc_server = IPCServer::new(server.clone(), &cfg.ipc.listen_addr);
    let mut ipc_task = tokio::spawn(ipc_server.start(shutdown.clone()));

    // Graceful shutdown: the server process must not outlive the daemon
    let ipc_done = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received, cleaning up...");
            None
        }
        res = &mut ipc_task => Some(res),
    };

    server.shutdown().await;
    shutdown.cancel();

    let ipc_result = match ipc_done {
        Some(res) => res,
        None => ipc_task.await,
    };
    match ipc_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("IPC server error: {:#}", e),
        Err(e) => tracing::error!("IPC server task failed: {}", e),
    }

    tracing::info!("mc-daemon shutting down");
    Ok(())
}
