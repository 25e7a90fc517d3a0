//! Wire protocol: one JSON object per WebSocket text frame, discriminated by
//! a `"type"` field. Field names are camelCase.
//!
//! ## Client → broker
//!
//! | Type                     | Fields                                         | Reply                                   |
//! |--------------------------|------------------------------------------------|-----------------------------------------|
//! | `ping`                   | —                                              | `pong`                                  |
//! | `register`               | `clientType`, `clientId?`, `channelId?`        | `registration_success` / `registration_error` |
//! | `create_channel`         | `channelId`, `channelName?`                    | `channel_created` / `channel_creation_error` |
//! | `get_channels`           | `id?`                                          | `channels_list`                         |
//! | `send_command`           | `id`, `channelId`, `command`, `params?`        | later `command_result` / `command_error` |
//! | `command_result`         | `id` or `commandId`, `result`                  | — (relayed to the sender)               |
//! | `command_error`          | `id` or `commandId`, `error`                   | — (relayed to the sender)               |
//! | `check_figma_connection` | `id?`, `channelId?`                            | `figma_connection_status`               |
//! | `figma_event`            | anything                                       | — (observers only)                      |
//!
//! ## Broker → client
//!
//! See [`OutboundFrame`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection role, as carried in the `clientType` field of `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The design-tool plugin that executes commands. At most one per channel.
    Worker,
    /// An automation client that issues commands.
    Controller,
    /// A short-lived connection that only enumerates channels.
    Listing,
}

impl Role {
    /// Parse a wire `clientType`. Accepts the plugin's historical names and
    /// the plain role names.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "figma" | "worker" => Some(Self::Worker),
            "n8n" | "controller" => Some(Self::Controller),
            "n8n_get_channels" | "get_channels" | "listing" => Some(Self::Listing),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "figma",
            Self::Controller => "n8n",
            Self::Listing => "n8n_get_channels",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Snapshot of one channel, as returned by `get_channels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    #[serde(alias = "figmaClients")]
    pub worker_count: usize,
    #[serde(alias = "n8nClients")]
    pub controller_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFrame {
    #[serde(default)]
    pub client_type: String,
    pub client_id: Option<String>,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandFrame {
    pub id: Option<String>,
    pub channel_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// A worker's `command_result` / `command_error`. Workers may key the frame
/// by `id` or by `commandId`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeFrame {
    pub id: Option<String>,
    pub command_id: Option<String>,
    #[serde(default)]
    pub result: Value,
    pub error: Option<Value>,
    pub code: Option<String>,
}

impl OutcomeFrame {
    #[must_use]
    pub fn command_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.command_id.as_deref())
    }

    /// Render the `error` field as text. Workers send either a string or an
    /// object with a `message`.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| v.to_string(), ToString::to_string),
            None => "Command execution failed".to_string(),
        }
    }
}

/// Inbound frame, dispatched by the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    Ping,
    Register(RegisterFrame),
    CreateChannel {
        channel_id: Option<String>,
        channel_name: Option<String>,
    },
    GetChannels {
        id: Option<String>,
    },
    SendCommand(SendCommandFrame),
    CommandResult(OutcomeFrame),
    CommandError(OutcomeFrame),
    CheckFigmaConnection {
        id: Option<Value>,
        channel_id: Option<String>,
    },
    FigmaEvent {},
}

/// Outbound frame, queued on a connection's outbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Pong,
    RegistrationSuccess {
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
    },
    RegistrationError {
        error: String,
        code: &'static str,
    },
    ChannelCreated {
        channel_id: String,
        channel_name: String,
    },
    ChannelCreationError {
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        error: String,
    },
    ChannelCreatedBroadcast {
        channel_id: String,
        channel_name: String,
        timestamp: DateTime<Utc>,
    },
    ChannelsList {
        channels: Vec<ChannelSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// A command forwarded to the channel's worker.
    Command {
        id: String,
        command: String,
        params: Value,
        timestamp: DateTime<Utc>,
        channel_id: String,
    },
    CommandResult {
        command_id: String,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    CommandError {
        command_id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        timestamp: DateTime<Utc>,
    },
    FigmaConnectionStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        connected: bool,
        worker_count: usize,
    },
}

impl OutboundFrame {
    /// Serialize to the JSON text sent on the socket.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Pull the `type` discriminator out of a raw frame, for logging.
#[must_use]
pub fn frame_type(raw: &Value) -> &str {
    raw["type"].as_str().unwrap_or("")
}
