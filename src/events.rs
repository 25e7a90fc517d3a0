//! Broker lifecycle events and the workflow-trigger feed built on them.
//!
//! The broker publishes [`BrokerEvent`]s on a `tokio::sync::broadcast`
//! channel. Any number of observers subscribe; a lagging observer loses
//! events rather than slowing the broker down. Events never go back out over
//! the wire to other connections.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::protocol::Role;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: String,
        role: Role,
        channel_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// `client_id`/`role` are `None` when the socket never registered.
    ClientDisconnected {
        client_id: Option<String>,
        role: Option<Role>,
        channel_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ChannelCreated {
        channel_id: String,
        channel_name: String,
        timestamp: DateTime<Utc>,
    },
    /// A command was forwarded to a worker.
    CommandDispatched {
        command_id: String,
        command: String,
        params: Value,
        channel_id: String,
        timestamp: DateTime<Utc>,
    },
    CommandResult {
        command_id: String,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    CommandFailed {
        command_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A `figma_event` frame sent unsolicited by a worker.
    WorkerEvent {
        payload: Value,
        timestamp: DateTime<Utc>,
    },
}

/// Event kinds a workflow trigger can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    ClientConnected,
    ClientDisconnected,
    CommandReceived,
    CommandResult,
    WorkerEvent,
}

impl TriggerKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientConnected => "client_connected",
            Self::ClientDisconnected => "client_disconnected",
            Self::CommandReceived => "command_received",
            Self::CommandResult => "command_result",
            Self::WorkerEvent => "worker_event",
        }
    }

    /// Which trigger kind an event maps to, if any.
    #[must_use]
    pub fn of(event: &BrokerEvent) -> Option<Self> {
        match event {
            BrokerEvent::ClientConnected { .. } => Some(Self::ClientConnected),
            BrokerEvent::ClientDisconnected { .. } => Some(Self::ClientDisconnected),
            BrokerEvent::CommandDispatched { .. } => Some(Self::CommandReceived),
            BrokerEvent::CommandResult { .. } => Some(Self::CommandResult),
            BrokerEvent::WorkerEvent { .. } => Some(Self::WorkerEvent),
            BrokerEvent::ChannelCreated { .. } | BrokerEvent::CommandFailed { .. } => None,
        }
    }
}

/// Default trigger kinds when none are configured.
#[must_use]
pub fn default_trigger_kinds() -> Vec<TriggerKind> {
    vec![
        TriggerKind::ClientConnected,
        TriggerKind::CommandReceived,
        TriggerKind::CommandResult,
    ]
}

/// Turns broker events into workflow-trigger payloads.
pub struct TriggerFeed {
    server_id: String,
    trigger_id: String,
    enabled: HashSet<TriggerKind>,
}

impl TriggerFeed {
    /// `server_id` of `None` generates `server_<8 hex>`.
    pub fn new(server_id: Option<String>, enabled: impl IntoIterator<Item = TriggerKind>) -> Self {
        let server_id = server_id.filter(|s| !s.is_empty()).unwrap_or_else(|| {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            format!("server_{}", &uuid[..8])
        });
        let trigger_id = format!("trigger_{server_id}_{}", Utc::now().timestamp_millis());
        Self {
            server_id,
            trigger_id,
            enabled: enabled.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Build the trigger payload for an event, or `None` when its kind is
    /// not enabled.
    #[must_use]
    pub fn payload(&self, event: &BrokerEvent) -> Option<Value> {
        let kind = TriggerKind::of(event)?;
        if !self.enabled.contains(&kind) {
            return None;
        }
        let mut out = json!({
            "eventType": kind.as_str(),
            "timestamp": Utc::now(),
            "serverId": self.server_id,
            "triggerId": self.trigger_id,
        });
        let extra = match event {
            BrokerEvent::ClientConnected {
                client_id,
                role,
                channel_id,
                timestamp,
            } => json!({
                "clientInfo": {
                    "id": client_id,
                    "type": role,
                    "channelId": channel_id,
                    "timestamp": timestamp,
                },
            }),
            BrokerEvent::ClientDisconnected {
                client_id,
                role,
                channel_id,
                timestamp,
            } => json!({
                "clientInfo": {
                    "id": client_id,
                    "type": role,
                    "channelId": channel_id,
                    "timestamp": timestamp,
                },
            }),
            BrokerEvent::CommandDispatched {
                command_id,
                command,
                params,
                channel_id,
                ..
            } => json!({
                "command": command,
                "params": params,
                "commandId": command_id,
                "channelId": channel_id,
                "sourceType": "figma_plugin",
            }),
            BrokerEvent::CommandResult {
                command_id, result, ..
            } => json!({
                "commandId": command_id,
                "result": result,
                "sourceType": "figma_plugin",
            }),
            BrokerEvent::WorkerEvent { payload, .. } => json!({
                "payload": payload,
                "sourceType": "figma_plugin",
            }),
            BrokerEvent::ChannelCreated { .. } | BrokerEvent::CommandFailed { .. } => json!({}),
        };
        if let (Some(out), Value::Object(extra)) = (out.as_object_mut(), extra) {
            out.extend(extra);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> BrokerEvent {
        BrokerEvent::ClientConnected {
            client_id: "plugin".into(),
            role: Role::Worker,
            channel_id: Some("c1".into()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn generated_server_id_has_prefix() {
        let feed = TriggerFeed::new(None, default_trigger_kinds());
        assert!(feed.server_id().starts_with("server_"));
        assert_eq!(feed.server_id().len(), "server_".len() + 8);
    }

    #[test]
    fn disabled_kinds_are_filtered() {
        let feed = TriggerFeed::new(Some("s1".into()), [TriggerKind::CommandResult]);
        assert!(feed.payload(&connected()).is_none());
    }

    #[test]
    fn client_connected_payload_shape() {
        let feed = TriggerFeed::new(Some("s1".into()), default_trigger_kinds());
        let payload = feed.payload(&connected()).unwrap();
        assert_eq!(payload["eventType"], "client_connected");
        assert_eq!(payload["serverId"], "s1");
        assert_eq!(payload["clientInfo"]["type"], "figma");
        assert_eq!(payload["clientInfo"]["channelId"], "c1");
    }

    #[test]
    fn command_received_payload_carries_params() {
        let feed = TriggerFeed::new(Some("s1".into()), default_trigger_kinds());
        let payload = feed
            .payload(&BrokerEvent::CommandDispatched {
                command_id: "id-1".into(),
                command: "create_rectangle".into(),
                params: json!({"width": 10}),
                channel_id: "c1".into(),
                timestamp: Utc::now(),
            })
            .unwrap();
        assert_eq!(payload["eventType"], "command_received");
        assert_eq!(payload["commandId"], "id-1");
        assert_eq!(payload["params"]["width"], 10);
    }

    #[test]
    fn trigger_kinds_deserialize_snake_case() {
        let kinds: Vec<TriggerKind> =
            serde_json::from_value(json!(["client_disconnected", "worker_event"])).unwrap();
        assert_eq!(
            kinds,
            vec![TriggerKind::ClientDisconnected, TriggerKind::WorkerEvent]
        );
    }
}
