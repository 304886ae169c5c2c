#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use beach_connector::connection::{ConnectionSettings, ConnectionTimings};
use beach_connector::protocol::Credential;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

pub const TOKEN: &str = "test-token";
pub const WAIT: Duration = Duration::from_secs(5);

/// Timings shrunk so liveness and backoff behaviour is observable in tests.
pub fn fast_timings() -> ConnectionTimings {
    ConnectionTimings {
        handshake_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_millis(500),
        liveness_window: Duration::from_secs(30),
        keepalive_interval: Duration::from_secs(25),
        heartbeat_interval: Duration::from_secs(60),
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        close_timeout: Duration::from_secs(2),
        ..ConnectionTimings::default()
    }
}

pub fn settings(url: &str, timings: ConnectionTimings) -> ConnectionSettings {
    ConnectionSettings {
        url: url.to_string(),
        credential: Credential::new(TOKEN, "connector-test", "Test Connector"),
        timings,
    }
}

/// In-process coordinator endpoint.
pub struct MockCoordinator {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl MockCoordinator {
    pub async fn bind() -> Self {
        Self::bind_to("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn bind_to(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.expect("bind mock coordinator");
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws/connector", self.addr)
    }

    /// Accepts a TCP connection without performing the WebSocket handshake.
    pub async fn accept_raw(&self) -> TcpStream {
        self.listener.accept().await.expect("accept").0
    }

    /// Accepts one connector session and reads its credential.
    pub async fn accept(&self) -> Peer {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("connector did not dial in time")
            .expect("accept");

        let mut authorization = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            authorization = request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok(response)
        })
        .await
        .expect("websocket handshake");

        let mut peer = Peer {
            ws,
            authorization,
            credential: Value::Null,
        };
        peer.credential = match peer.next_message().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).expect("credential json"),
            other => panic!("expected credential text frame, got {other:?}"),
        };
        peer
    }
}

pub struct Peer {
    ws: WebSocketStream<TcpStream>,
    pub authorization: Option<String>,
    pub credential: Value,
}

impl Peer {
    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("send to connector");
    }

    /// Next application item, skipping transport frames and connector pings.
    /// `None` once the connector closes.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.next_message().await? {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).expect("connector json");
                    if value["type"] == "ping" {
                        continue;
                    }
                    return Some(value);
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Transport-level ping, invisible to the connector's application layer.
    pub async fn send_ping(&mut self, payload: &[u8]) {
        self.ws
            .send(Message::Ping(payload.to_vec()))
            .await
            .expect("ping connector");
    }

    /// Next frame of any kind, control frames included. `None` on timeout
    /// or once the stream ends.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<Message> {
        match timeout(wait, self.ws.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            _ => None,
        }
    }

    /// Next non-control frame, `Close` included.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            let next = timeout(WAIT, self.ws.next())
                .await
                .expect("connector went silent");
            match next {
                None | Some(Err(_)) => return None,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(message)) => return Some(message),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        while let Ok(Some(Ok(_))) = timeout(WAIT, self.ws.next()).await {}
    }
}
