use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnectorConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::error::StartupError;
use crate::executor::{CommandExecutor, TempFileStore, staging};
use crate::router::MessageRouter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds every component, runs until `shutdown` fires, then closes the
/// connection.
pub async fn run(config: ConnectorConfig, shutdown: CancellationToken) -> Result<(), StartupError> {
    let store = TempFileStore::open(&config.staging_dir).map_err(|source| StartupError::Staging {
        path: config.staging_dir.clone(),
        source,
    })?;
    let store = Arc::new(store);
    let executor = Arc::new(CommandExecutor::with_command_path(
        config.command_path.as_deref(),
        config.timeout,
        Arc::clone(&store),
    )?);

    let manager = ConnectionManager::new(
        ConnectionSettings {
            url: config.server_url.clone(),
            credential: config.credential(),
            timings: config.timings(),
        },
        &shutdown,
    );
    let inbound = manager
        .receive()
        .ok_or(StartupError::InboundClaimed)?;

    let router = Arc::new(MessageRouter::new(executor, manager.clone()));
    let router_task = router.spawn(inbound, shutdown.clone());
    let sweeper = staging::spawn_sweeper(
        Arc::clone(&store),
        config.sweep_interval,
        config.retention,
        shutdown.clone(),
    );

    info!(
        target: "connector::app",
        url = %config.server_url,
        client_id = %config.client_id,
        staging = %store.root().display(),
        timeout_secs = config.timeout.as_secs(),
        "connector starting"
    );
    manager.start().await;

    shutdown.cancelled().await;
    info!(target: "connector::app", "shutdown requested");
    manager.close().await;
    for (name, task) in [("router", router_task), ("sweeper", sweeper)] {
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            warn!(target: "connector::app", task = name, "task did not stop in time");
        }
    }
    Ok(())
}
