//! JSON items exchanged with the coordinator, one item per text frame.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CLIENT_TYPE: &str = "connector";

/// Value of the `type` field on every non-credential item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Auth,
    Execute,
    Upload,
    Ping,
    Pong,
    Response,
    /// Anything the connector does not understand; the raw tag is kept so the
    /// failure reply can name it.
    Other(String),
}

impl Default for MessageKind {
    /// A missing tag; the router answers it as an unknown request.
    fn default() -> Self {
        MessageKind::Other(String::new())
    }
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Auth => "auth",
            MessageKind::Execute => "execute",
            MessageKind::Upload => "upload",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Response => "response",
            MessageKind::Other(raw) => raw,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auth" => MessageKind::Auth,
            "execute" => MessageKind::Execute,
            "upload" => MessageKind::Upload,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "response" => MessageKind::Response,
            _ => MessageKind::Other(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First application message of every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    pub client_id: String,
    pub client_name: String,
    pub client_type: String,
}

impl Credential {
    pub fn new(
        token: impl Into<String>,
        client_id: impl Into<String>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            client_id: client_id.into(),
            client_name: client_name.into(),
            client_type: CLIENT_TYPE.to_string(),
        }
    }
}

/// Inbound request from the coordinator. Heartbeat items share this shape and
/// are told apart by `kind`. Every field tolerates an explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: MessageKind,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub command: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
}

impl WorkItem {
    /// Working directory with the empty string treated as unset.
    pub fn working_directory(&self) -> Option<&str> {
        self.work_dir.as_deref().filter(|dir| !dir.trim().is_empty())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reply correlated to a [`WorkItem`] by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: i64,
}

impl ResultItem {
    pub fn success(id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            success: true,
            output: output.into(),
            error: String::new(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            success: false,
            output: String::new(),
            error: error.into(),
            timestamp: unix_timestamp(),
        }
    }
}

/// Application-level ping/pong item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn ping() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Ping,
            timestamp: unix_timestamp(),
        }
    }

    /// Pong answering the ping with `id`.
    pub fn pong(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Pong,
            timestamp: unix_timestamp(),
        }
    }
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

pub fn decode_work_item(text: &str) -> Result<WorkItem, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn encode<T: Serialize>(item: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(item)
}
