//! Wire envelopes exchanged with browsers and between server instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_NOTIFICATION: &str = "notification";

/// Prefix of every cross-node broadcast channel.
pub const CHANNEL_PREFIX: &str = "broadcast";

/// Pattern each instance subscribes to.
pub const CHANNEL_PATTERN: &str = "broadcast:*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    User,
    Org,
    Room,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::User => "user",
            Target::Org => "org",
            Target::Room => "room",
        }
    }

    /// `broadcast:<target>:<target_id>`
    pub fn channel(&self, target_id: &str) -> String {
        format!("{CHANNEL_PREFIX}:{}:{target_id}", self.as_str())
    }
}

/// The bus envelope.
///
/// Clients send `{type, target, targetID, content}`; the server stamps the
/// sender ids and, when publishing, its own `serverID`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(rename = "targetID", default)]
    pub target_id: String,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "orgID", default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(rename = "serverID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    pub fn is_ping(&self) -> bool {
        self.kind == TYPE_PING
    }
}

/// Outbound frame body: `{type, data, timestamp?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Frame {
    pub fn notification(data: Value, timestamp: i64) -> Self {
        Self {
            kind: TYPE_NOTIFICATION.to_string(),
            data,
            timestamp: Some(timestamp),
        }
    }

    pub fn pong(received: Value, timestamp: i64) -> Self {
        Self {
            kind: TYPE_PONG.to_string(),
            data: serde_json::json!({ "timestamp": timestamp, "received": received }),
            timestamp: None,
        }
    }
}
