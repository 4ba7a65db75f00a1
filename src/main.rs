/*!
 * Scoped Exec Helper - Main Entry Point
 *
 * Privileged execution process: listens on a Unix socket, authenticates
 * each client session and runs allow-listed tools on its behalf.
 */

use anyhow::Context;
use scoped_exec::{
    init_tracing, CancelToken, ExecConfig, ExecutionService, PathCapabilityPlatform, SharedPlatform,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured tracing
    init_tracing();

    let config = ExecConfig::from_env().context("invalid SCOPED_EXEC_* configuration")?;
    info!(
        socket = %config.socket_path.display(),
        allowed = ?config.allowed_commands,
        "Scoped exec helper starting"
    );

    let platform: SharedPlatform = Arc::new(PathCapabilityPlatform::new());
    let service = Arc::new(ExecutionService::new(&config, platform));
    let listener = service.bind().context("failed to bind helper socket")?;

    let shutdown = CancelToken::new();
    let trigger = shutdown.clone();
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        trigger.cancel();
    });

    service.serve(listener, shutdown).await?;
    info!("Scoped exec helper stopped");
    Ok(())
}
