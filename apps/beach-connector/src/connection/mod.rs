//! Long-lived WebSocket session to the coordinator.
//!
//! A [`ConnectionManager`] owns at most one live session. Each session runs a
//! read loop, a write loop and an application heartbeat loop; any transport
//! failure tears the session down and starts the reconnect loop, which keeps
//! retrying with exponential backoff until it succeeds or the manager is
//! closed. Work items leave the manager through a single bounded inbound
//! queue that survives reconnects.

mod backoff;
mod session;

pub use backoff::Backoff;

use crate::protocol::{self, Credential, WorkItem};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Handshake(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("not connected to coordinator")]
    NotConnected,
    #[error("outbound queue stayed full for {}s", .0.as_secs_f64())]
    SendTimeout(Duration),
    #[error("inbound queue full; dropped item '{id}'")]
    QueueOverload { id: String },
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection manager is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ConnectionTimings {
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub send_timeout: Duration,
    /// Maximum silence on the read side before the session is declared dead.
    pub liveness_window: Duration,
    /// Transport ping cadence when nothing else has been written.
    pub keepalive_interval: Duration,
    /// Application `ping` item cadence.
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub close_timeout: Duration,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            liveness_window: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(54),
            heartbeat_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5 * 60),
            close_timeout: Duration::from_secs(5),
            inbound_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub credential: Credential,
    pub timings: ConnectionTimings,
}

struct LiveSession {
    epoch: u64,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

struct SessionState {
    phase: ConnectionPhase,
    backoff: Backoff,
    epoch: u64,
    reconnecting: bool,
    live: Option<LiveSession>,
}

impl SessionState {
    fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected && self.live.is_some()
    }
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    state: AsyncMutex<SessionState>,
    phase_tx: watch::Sender<ConnectionPhase>,
    inbound_tx: mpsc::Sender<WorkItem>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<WorkItem>>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// `parent` is the process-wide shutdown signal; cancelling it stops
    /// every loop this manager starts.
    pub fn new(settings: ConnectionSettings, parent: &CancellationToken) -> Arc<Self> {
        let timings = &settings.timings;
        let (inbound_tx, inbound_rx) = mpsc::channel(timings.inbound_capacity.max(1));
        let (phase_tx, _) = watch::channel(ConnectionPhase::Disconnected);
        let state = SessionState {
            phase: ConnectionPhase::Disconnected,
            backoff: Backoff::new(timings.initial_backoff, timings.max_backoff),
            epoch: 0,
            reconnecting: false,
            live: None,
        };
        Arc::new(Self {
            state: AsyncMutex::new(state),
            phase_tx,
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            shutdown: parent.child_token(),
            settings,
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.state.lock().await.phase
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_connected()
    }

    pub async fn backoff_interval(&self) -> Duration {
        self.state.lock().await.backoff.current()
    }

    /// Observes phase transitions without taking the session lock.
    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    /// The inbound work stream. There is exactly one; later calls get `None`.
    pub fn receive(&self) -> Option<mpsc::Receiver<WorkItem>> {
        self.inbound_rx
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take())
    }

    /// Connects now, or falls back to the reconnect loop when the first
    /// attempt fails.
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.connect().await {
            warn!(target: "connector::connection", error = %err, "initial connection failed; retrying in background");
            let mut state = self.state.lock().await;
            self.schedule_reconnect(&mut state);
        }
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        let mut state = self.state.lock().await;
        if state.is_connected() {
            return Ok(());
        }

        self.set_phase(&mut state, ConnectionPhase::Connecting);
        match self.establish(&mut state).await {
            Ok(()) => {
                state.backoff.reset();
                self.set_phase(&mut state, ConnectionPhase::Connected);
                info!(
                    target: "connector::connection",
                    url = %self.settings.url,
                    epoch = state.epoch,
                    "connected to coordinator"
                );
                Ok(())
            }
            Err(err) => {
                self.set_phase(&mut state, ConnectionPhase::Disconnected);
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>, state: &mut SessionState) -> Result<(), ConnectionError> {
        let timings = &self.settings.timings;
        let mut request = self
            .settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectionError::Handshake(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.settings.credential.token))
            .map_err(|err| ConnectionError::Handshake(format!("invalid authorization header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(target: "connector::connection", url = %self.settings.url, "opening websocket");
        let (mut ws, _response) = timeout(timings.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| {
                ConnectionError::Handshake(format!(
                    "handshake timed out after {}s",
                    timings.handshake_timeout.as_secs_f64()
                ))
            })?
            .map_err(|err| ConnectionError::Handshake(err.to_string()))?;

        self.set_phase(state, ConnectionPhase::Authenticating);
        let credential = protocol::encode(&self.settings.credential)?;
        let sent = timeout(timings.write_timeout, ws.send(Message::Text(credential))).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ConnectionError::Authentication(err.to_string())),
            Err(_) => {
                return Err(ConnectionError::Authentication(
                    "credential write timed out".to_string(),
                ));
            }
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let cancel = self.shutdown.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(timings.outbound_capacity.max(1));
        let (sink, stream) = ws.split();

        let writer = tokio::spawn(session::write_loop(
            Arc::clone(self),
            epoch,
            sink,
            outbound_rx,
            cancel.clone(),
        ));
        tokio::spawn(session::read_loop(
            Arc::clone(self),
            epoch,
            stream,
            outbound_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(session::heartbeat_loop(
            outbound_tx.clone(),
            timings.heartbeat_interval,
            timings.send_timeout,
            cancel.clone(),
        ));

        state.live = Some(LiveSession {
            epoch,
            outbound: outbound_tx,
            cancel,
            writer,
        });
        Ok(())
    }

    /// Serializes `item` and queues it for the write loop, waiting at most the
    /// send timeout for queue capacity.
    pub async fn send<T: Serialize>(&self, item: &T) -> Result<(), ConnectionError> {
        let outbound = {
            let state = self.state.lock().await;
            match &state.live {
                Some(live) if state.is_connected() => live.outbound.clone(),
                _ => return Err(ConnectionError::NotConnected),
            }
        };
        let text = protocol::encode(item)?;
        let limit = self.settings.timings.send_timeout;
        outbound
            .send_timeout(text, limit)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => ConnectionError::SendTimeout(limit),
                SendTimeoutError::Closed(_) => ConnectionError::NotConnected,
            })
    }

    /// Stops every loop, sends a normal close frame and releases the
    /// transport. Calling it again is a no-op.
    pub async fn close(&self) {
        let live = {
            let mut state = self.state.lock().await;
            self.shutdown.cancel();
            self.set_phase(&mut state, ConnectionPhase::Disconnected);
            state.live.take()
        };
        let Some(live) = live else {
            return;
        };
        live.cancel.cancel();
        drop(live.outbound);
        match timeout(self.settings.timings.close_timeout, live.writer).await {
            Ok(_) => info!(target: "connector::connection", epoch = live.epoch, "connection closed"),
            Err(_) => warn!(
                target: "connector::connection",
                epoch = live.epoch,
                "write loop did not finish before close timeout"
            ),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn push_inbound(&self, item: WorkItem) -> Result<(), ConnectionError> {
        self.inbound_tx.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) => ConnectionError::QueueOverload { id: item.id },
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Tears down the session identified by `epoch` if it is still current.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, epoch: u64, reason: &str) {
        let mut state = self.state.lock().await;
        if state.live.as_ref().map(|live| live.epoch) != Some(epoch) {
            return;
        }
        if let Some(live) = state.live.take() {
            live.cancel.cancel();
        }
        self.set_phase(&mut state, ConnectionPhase::Disconnected);
        warn!(target: "connector::connection", epoch, reason, "session lost");
        self.schedule_reconnect(&mut state);
    }

    /// At most one reconnect loop runs at a time; it alone clears
    /// `reconnecting`, and only once it sees a live session.
    fn schedule_reconnect(self: &Arc<Self>, state: &mut SessionState) {
        if self.shutdown.is_cancelled() || state.reconnecting {
            return;
        }
        state.reconnecting = true;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let delay = {
                let mut state = self.state.lock().await;
                if state.is_connected() {
                    state.reconnecting = false;
                    return;
                }
                self.set_phase(&mut state, ConnectionPhase::Reconnecting);
                state.backoff.current()
            };
            info!(
                target: "connector::connection",
                delay_ms = delay.as_millis() as u64,
                "reconnecting after delay"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect().await {
                // The flag is cleared at the top of the loop, under the same
                // lock that observes the live session.
                Ok(()) => info!(target: "connector::connection", "reconnected"),
                Err(ConnectionError::Closed) => return,
                Err(err) => {
                    let next = self.state.lock().await.backoff.advance();
                    warn!(
                        target: "connector::connection",
                        error = %err,
                        next_delay_ms = next.as_millis() as u64,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }

    fn set_phase(&self, state: &mut SessionState, phase: ConnectionPhase) {
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}
