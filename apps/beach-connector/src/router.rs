//! Dispatches inbound work to the executor and sends back one result per item.

use crate::connection::{ConnectionError, ConnectionManager};
use crate::executor::CommandExecutor;
use crate::protocol::{MessageKind, ResultItem, WorkItem};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NO_FILES_ERROR: &str = "no files to upload";
pub const UNKNOWN_KIND_ERROR: &str = "unknown request type";

/// Where finished results go. The connection manager is the production sink.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: &ResultItem) -> Result<(), ConnectionError>;
}

#[async_trait]
impl ResultSink for ConnectionManager {
    async fn deliver(&self, result: &ResultItem) -> Result<(), ConnectionError> {
        self.send(result).await
    }
}

pub struct MessageRouter {
    executor: Arc<CommandExecutor>,
    sink: Arc<dyn ResultSink>,
}

impl MessageRouter {
    pub fn new(executor: Arc<CommandExecutor>, sink: Arc<dyn ResultSink>) -> Self {
        Self { executor, sink }
    }

    /// Produces the result for a single item. Never fails; every error
    /// becomes a `success: false` result.
    pub async fn dispatch(&self, item: &WorkItem) -> ResultItem {
        match &item.kind {
            MessageKind::Execute => {
                match self
                    .executor
                    .execute(&item.command, item.working_directory(), &item.files)
                    .await
                {
                    Ok(output) => ResultItem::success(&item.id, output),
                    Err(err) => ResultItem::failure(&item.id, err.to_string()),
                }
            }
            MessageKind::Upload if item.files.is_empty() => {
                ResultItem::failure(&item.id, NO_FILES_ERROR)
            }
            MessageKind::Upload => {
                debug!(
                    target: "connector::router",
                    id = %item.id,
                    files = item.files.len(),
                    "acknowledging upload"
                );
                ResultItem::success(&item.id, format!("received {} file(s)", item.files.len()))
            }
            other => {
                warn!(target: "connector::router", id = %item.id, kind = %other, "unknown request type");
                ResultItem::failure(&item.id, UNKNOWN_KIND_ERROR)
            }
        }
    }

    /// Dispatches and delivers. Delivery failures are logged, never retried.
    pub async fn handle(&self, item: WorkItem) {
        let result = self.dispatch(&item).await;
        match self.sink.deliver(&result).await {
            Ok(()) => debug!(
                target: "connector::router",
                id = %result.id,
                success = result.success,
                "result sent"
            ),
            Err(err) => warn!(
                target: "connector::router",
                id = %result.id,
                error = %err,
                "failed to send result"
            ),
        }
    }

    /// Consumes `inbound` until it closes or `shutdown` fires. Each item runs
    /// on its own task, so results may complete out of order.
    pub fn spawn(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<WorkItem>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = inbound.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                debug!(target: "connector::router", id = %item.id, kind = %item.kind, "work item received");
                let router = Arc::clone(&self);
                tokio::spawn(async move { router.handle(item).await });
            }
            info!(target: "connector::router", "router stopped");
        })
    }
}
