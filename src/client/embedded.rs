//! Embedded relay — a controller living in the broker's own process.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use super::{ClientPurpose, CommandRelay};
use crate::broker::Broker;
use crate::error::{CommandFailure, RelayError, RoutingError};
use crate::ledger::new_command_id;
use crate::protocol::ChannelSummary;

/// Relay that calls a broker living in the same process. No socket hop, no
/// registration; the channel is just remembered for later calls.
pub struct EmbeddedRelay {
    broker: Broker,
    channel_id: RwLock<Option<String>>,
    /// Ids of commands this relay is still waiting on.
    in_flight: Mutex<HashSet<String>>,
}

impl EmbeddedRelay {
    #[must_use]
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            channel_id: RwLock::new(None),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    async fn channel(&self) -> Result<String, RelayError> {
        self.channel_id
            .read()
            .await
            .clone()
            .ok_or(RelayError::Routing(RoutingError::MissingChannelId))
    }
}

#[async_trait]
impl CommandRelay for EmbeddedRelay {
    async fn connect(
        &self,
        purpose: ClientPurpose,
        channel_id: Option<&str>,
    ) -> Result<(), RelayError> {
        let channel_id = channel_id.filter(|c| !c.is_empty());
        if purpose == ClientPurpose::Command {
            let cid = channel_id.ok_or(RoutingError::MissingChannelId)?;
            if !self.broker.channel_exists(cid).await {
                let available = self
                    .broker
                    .list_channels()
                    .await
                    .into_iter()
                    .map(|c| c.id)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(RoutingError::ChannelNotFound {
                    channel_id: cid.to_string(),
                    available,
                }
                .into());
            }
        }
        *self.channel_id.write().await = channel_id.map(ToString::to_string);
        info!(
            purpose = ?purpose,
            channel_id = channel_id.unwrap_or("none"),
            "Embedded relay attached"
        );
        Ok(())
    }

    async fn send_command(&self, command: &str, params: Value) -> Result<Value, RelayError> {
        let channel_id = self.channel().await?;
        let command_id = new_command_id();
        self.in_flight.lock().await.insert(command_id.clone());

        let dispatched = self
            .broker
            .dispatch_command(Some(&channel_id), Some(command_id.clone()), command, params, None)
            .await;
        let completion = match dispatched {
            Ok(completion) => completion,
            Err(e) => {
                self.in_flight.lock().await.remove(&command_id);
                return Err(e.into());
            }
        };
        // disconnect() ran while the command was being dispatched.
        if !self.in_flight.lock().await.contains(&command_id) {
            self.broker
                .ledger()
                .reject(&command_id, CommandFailure::connection_closed())
                .await;
        }

        let outcome = completion.wait().await;
        self.in_flight.lock().await.remove(&command_id);
        outcome
    }

    async fn get_channels(&self) -> Result<Vec<ChannelSummary>, RelayError> {
        Ok(self.broker.list_channels().await)
    }

    async fn create_channel(&self, id: &str, name: Option<&str>) -> Result<(), RelayError> {
        self.broker.create_channel(id, name).await?;
        Ok(())
    }

    async fn is_worker_connected(&self) -> Result<bool, RelayError> {
        let channel_id = self.channel_id.read().await.clone();
        Ok(self.broker.worker_count(channel_id.as_deref()).await > 0)
    }

    async fn disconnect(&self) {
        self.channel_id.write().await.take();
        let pending: Vec<String> = self.in_flight.lock().await.drain().collect();
        let mut failed = 0;
        for command_id in pending {
            if self
                .broker
                .ledger()
                .reject(&command_id, CommandFailure::connection_closed())
                .await
            {
                failed += 1;
            }
        }
        if failed > 0 {
            info!(failed, "Embedded relay detached with commands in flight");
        }
    }
}
