//! Relay client — how a controller talks to a broker.
//!
//! [`EmbeddedRelay`] calls a [`Broker`](crate::broker::Broker) in the same
//! process. [`RemoteRelay`] speaks the wire protocol over its own WebSocket.
//! Callers pick one at construction and use it through [`CommandRelay`].

mod embedded;
mod remote;

pub use embedded::EmbeddedRelay;
pub use remote::RemoteRelay;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RelayError;
use crate::protocol::{ChannelSummary, Role};

/// What a relay connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPurpose {
    /// Issue commands into one channel, registered as a controller.
    Command,
    /// Only enumerate channels; never occupies a channel slot.
    ListChannels,
}

impl ClientPurpose {
    #[must_use]
    pub fn role(self) -> Role {
        match self {
            Self::Command => Role::Controller,
            Self::ListChannels => Role::Listing,
        }
    }
}

/// Operations a controller performs against a broker.
#[async_trait]
pub trait CommandRelay: Send + Sync {
    /// Attach to the broker. `Command` purpose needs an existing channel.
    async fn connect(
        &self,
        purpose: ClientPurpose,
        channel_id: Option<&str>,
    ) -> Result<(), RelayError>;

    /// Run a command on the connected channel's worker and wait for its result.
    async fn send_command(&self, command: &str, params: Value) -> Result<Value, RelayError>;

    async fn get_channels(&self) -> Result<Vec<ChannelSummary>, RelayError>;

    async fn create_channel(&self, id: &str, name: Option<&str>) -> Result<(), RelayError>;

    /// Whether a worker is attached to the connected channel (or to any
    /// channel when not connected to one).
    async fn is_worker_connected(&self) -> Result<bool, RelayError>;

    /// Drop the connection. Pending commands fail with a connection error.
    /// Safe to call more than once.
    async fn disconnect(&self);
}
