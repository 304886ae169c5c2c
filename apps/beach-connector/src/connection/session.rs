use super::ConnectionManager;
use crate::protocol::{self, Heartbeat, MessageKind, ResultItem};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(super) type SocketSink = SplitSink<Socket, Message>;
pub(super) type SocketStream = SplitStream<Socket>;

/// Decodes inbound frames until the session ends. Silence longer than the
/// liveness window counts as a dead transport.
pub(super) async fn read_loop(
    manager: Arc<ConnectionManager>,
    epoch: u64,
    mut stream: SocketStream,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let liveness = manager.settings.timings.liveness_window;
    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(target: "connector::connection", epoch, "read loop cancelled");
                return;
            }
            next = timeout(liveness, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                break format!(
                    "no traffic for {}s",
                    liveness.as_secs_f64()
                );
            }
            Ok(None) => break "stream ended".to_string(),
            Ok(Some(Err(err))) => break format!("read error: {err}"),
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(target: "connector::connection", epoch, "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(frame) => {
                break match frame {
                    Some(frame) => format!("peer closed ({}): {}", frame.code, frame.reason),
                    None => "peer closed".to_string(),
                };
            }
            // Transport pings are answered by tungstenite; any frame already
            // refreshed the liveness deadline.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        handle_text(&manager, epoch, &text, &outbound);
    };

    if !cancel.is_cancelled() {
        manager.handle_disconnect(epoch, &reason).await;
    }
}

fn handle_text(
    manager: &ConnectionManager,
    epoch: u64,
    text: &str,
    outbound: &mpsc::Sender<String>,
) {
    let item = match protocol::decode_work_item(text) {
        Ok(item) => item,
        Err(err) => {
            reject_malformed(epoch, text, &err, outbound);
            return;
        }
    };

    match &item.kind {
        MessageKind::Ping => {
            let pong = Heartbeat::pong(item.id.clone());
            let queued = protocol::encode(&pong)
                .map_err(|err| err.to_string())
                .and_then(|text| outbound.try_send(text).map_err(|err| err.to_string()));
            if let Err(err) = queued {
                warn!(target: "connector::connection", epoch, id = %item.id, error = %err, "failed to queue pong");
            }
        }
        MessageKind::Pong => {
            trace!(target: "connector::connection", epoch, id = %item.id, "heartbeat acknowledged");
        }
        MessageKind::Response | MessageKind::Auth => {
            debug!(target: "connector::connection", epoch, id = %item.id, kind = %item.kind, "ignoring coordinator item");
        }
        _ => {
            if let Err(err) = manager.push_inbound(item) {
                warn!(target: "connector::connection", epoch, error = %err, "inbound item dropped");
            }
        }
    }
}

/// Answers an item that failed to decode when it still carries a readable
/// `id`; anything else is only logged.
fn reject_malformed(
    epoch: u64,
    text: &str,
    err: &serde_json::Error,
    outbound: &mpsc::Sender<String>,
) {
    let id = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(|id| id.as_str()).map(str::to_string));
    let Some(id) = id else {
        warn!(target: "connector::connection", epoch, error = %err, "dropping undecodable item");
        return;
    };
    warn!(target: "connector::connection", epoch, id = %id, error = %err, "rejecting malformed item");
    let reply = ResultItem::failure(id, format!("invalid request: {err}"));
    let queued = protocol::encode(&reply)
        .map_err(|err| err.to_string())
        .and_then(|text| outbound.try_send(text).map_err(|err| err.to_string()));
    if let Err(err) = queued {
        warn!(target: "connector::connection", epoch, error = %err, "failed to queue rejection");
    }
}

/// Sole writer of the socket. Sends a transport ping whenever nothing has
/// been written for the keepalive interval.
pub(super) async fn write_loop(
    manager: Arc<ConnectionManager>,
    epoch: u64,
    mut sink: SocketSink,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let timings = manager.settings.timings.clone();
    let mut keepalive = interval_at(
        Instant::now() + timings.keepalive_interval,
        timings.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if manager.is_closed() {
                    send_close(&mut sink, timings.write_timeout).await;
                }
                return;
            }
            text = outbound.recv() => match text {
                Some(text) => Message::Text(text),
                None => break "outbound queue closed".to_string(),
            },
            _ = keepalive.tick() => Message::Ping(Vec::new()),
        };

        match timeout(timings.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => keepalive.reset(),
            Ok(Err(err)) => break format!("write error: {err}"),
            Err(_) => {
                break format!(
                    "write blocked for {}s",
                    timings.write_timeout.as_secs_f64()
                );
            }
        }
    };

    if !cancel.is_cancelled() {
        manager.handle_disconnect(epoch, &reason).await;
    }
}

async fn send_close(sink: &mut SocketSink, deadline: Duration) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed("connector shutting down"),
    };
    match timeout(deadline, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {
            let _ = timeout(deadline, sink.close()).await;
        }
        Ok(Err(err)) => {
            debug!(target: "connector::connection", error = %err, "close frame not delivered");
        }
        Err(_) => debug!(target: "connector::connection", "close frame timed out"),
    }
}

/// Queues an application `ping` item on every tick.
pub(super) async fn heartbeat_loop(
    outbound: mpsc::Sender<String>,
    every: Duration,
    send_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let ping = Heartbeat::ping();
        let text = match protocol::encode(&ping) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "connector::connection", error = %err, "failed to encode heartbeat");
                continue;
            }
        };
        match outbound.send_timeout(text, send_timeout).await {
            Ok(()) => trace!(target: "connector::connection", id = %ping.id, "heartbeat queued"),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(target: "connector::connection", "heartbeat dropped; outbound queue full");
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => return,
        }
    }
}
