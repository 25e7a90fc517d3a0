//! Broker — owns the connection registry, the channel table and the
//! worker-bound pending-command ledger, and routes frames between them.
//!
//! ## Routing
//!
//! 1. A controller sends `send_command{id, channelId, command, params}`.
//! 2. The broker looks up the channel and its worker. A missing channel or an
//!    empty worker slot is answered immediately with `command_error` to the
//!    sender only, and nothing is recorded.
//! 3. Otherwise the worker receives `command{id, command, params, timestamp,
//!    channelId}` and a ledger entry is recorded that replies to the sender.
//! 4. The worker's `command_result` / `command_error` resolves the entry,
//!    which relays the outcome to the sender and wakes any in-process waiter.
//!
//! ## Serialization
//!
//! Registry and channel mutations run inside synchronous sections under one
//! `tokio::sync::Mutex<BrokerState>`. No `.await` happens while a mutation is
//! half applied. Lock order is state → ledger.

pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::channels::ChannelTable;
use crate::config::ServerConfig;
use crate::error::{ChannelError, CommandFailure, RelayError, RoutingError};
use crate::events::BrokerEvent;
use crate::ledger::{new_command_id, Completion, NewPending, PendingLedger};
use crate::protocol::{
    frame_type, ChannelSummary, InboundFrame, OutboundFrame, OutcomeFrame, RegisterFrame, Role,
    SendCommandFrame,
};
use crate::registry::{self, ConnectionId, ConnectionRegistry, Departure, Outbox};

/// Failure code relayed when a worker drops with commands in flight.
pub const WORKER_DISCONNECTED_CODE: &str = "WORKER_DISCONNECTED";

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 256;

/// Mutable routing state, only touched under the broker lock.
#[derive(Default)]
pub struct BrokerState {
    pub registry: ConnectionRegistry,
    pub channels: ChannelTable,
}

/// Counters reported by `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub channels: usize,
    pub connections: usize,
    pub workers: usize,
    pub pending_commands: usize,
}

/// The relay broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
    ledger: PendingLedger,
    events: broadcast::Sender<BrokerEvent>,
    command_timeout: Duration,
    outbound_queue: usize,
}

impl Broker {
    #[must_use]
    pub fn new(command_timeout: Duration, outbound_queue: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            ledger: PendingLedger::new("broker"),
            events,
            command_timeout,
            outbound_queue: outbound_queue.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.command_timeout(), config.outbound_queue)
    }

    /// Subscribe to lifecycle events (connections, commands, worker events).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn ledger(&self) -> &PendingLedger {
        &self.ledger
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn emit(&self, event: BrokerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ─── Connection lifecycle ───────────────────────────────────────────────

    /// Track a new socket. The receiver yields frames to write to it.
    pub async fn accept(&self) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(self.outbound_queue);
        let conn = self.state.lock().await.registry.attach(tx);
        debug!(conn_id = %conn, "Connection accepted");
        (conn, rx)
    }

    /// Socket closed. Idempotent. A departing worker fails its in-flight
    /// commands right away instead of leaving them to time out.
    pub async fn disconnect(&self, conn: &ConnectionId) {
        let departure = {
            let mut state = self.state.lock().await;
            let BrokerState { registry, channels } = &mut *state;
            registry::unregister(registry, channels, conn)
        };

        match departure {
            Departure::Unknown => {}
            Departure::Anonymous => self.emit(BrokerEvent::ClientDisconnected {
                client_id: None,
                role: None,
                channel_id: None,
                timestamp: Utc::now(),
            }),
            Departure::Registered(identity) => {
                if identity.role == Role::Worker {
                    let failure = CommandFailure::with_code(
                        format!(
                            "Worker disconnected from channel {}",
                            identity.channel_id.as_deref().unwrap_or("none")
                        ),
                        WORKER_DISCONNECTED_CODE,
                    );
                    let failed = self.ledger.reject_delivered_to(conn, &failure).await;
                    if failed > 0 {
                        warn!(conn_id = %conn, failed, "Failed in-flight commands of departed worker");
                    }
                }
                self.emit(BrokerEvent::ClientDisconnected {
                    client_id: Some(identity.client_id),
                    role: Some(identity.role),
                    channel_id: identity.channel_id,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    // ─── Frame dispatch ─────────────────────────────────────────────────────

    /// Handle one text frame from a connection. Invalid JSON and unknown
    /// frame types are logged and dropped.
    pub async fn handle_text(&self, conn: &ConnectionId, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn_id = %conn, "Dropping unparseable frame: {e}");
                return;
            }
        };
        self.handle_frame(conn, raw).await;
    }

    /// Dispatch a parsed frame by its `type`.
    pub async fn handle_frame(&self, conn: &ConnectionId, raw: Value) {
        let frame = match serde_json::from_value::<InboundFrame>(raw.clone()) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn, msg_type = frame_type(&raw), "Unknown or malformed frame: {e}");
                return;
            }
        };

        match frame {
            InboundFrame::Ping => self.reply(conn, OutboundFrame::Pong).await,
            InboundFrame::Register(req) => self.on_register(conn, &req).await,
            InboundFrame::CreateChannel {
                channel_id,
                channel_name,
            } => self.on_create_channel(conn, channel_id, channel_name).await,
            InboundFrame::GetChannels { id } => {
                let channels = self.list_channels().await;
                debug!(conn_id = %conn, count = channels.len(), "Sending channel list");
                self.reply(conn, OutboundFrame::ChannelsList { channels, id })
                    .await;
            }
            InboundFrame::SendCommand(cmd) => self.on_send_command(conn, cmd).await,
            InboundFrame::CommandResult(outcome) => self.on_outcome(conn, outcome, true).await,
            InboundFrame::CommandError(outcome) => self.on_outcome(conn, outcome, false).await,
            InboundFrame::CheckFigmaConnection { id, channel_id } => {
                let worker_count = self.worker_count(channel_id.as_deref()).await;
                self.reply(
                    conn,
                    OutboundFrame::FigmaConnectionStatus {
                        id,
                        connected: worker_count > 0,
                        worker_count,
                    },
                )
                .await;
            }
            InboundFrame::FigmaEvent {} => {
                if !self.is_registered(conn).await {
                    warn!(conn_id = %conn, "figma_event from unregistered connection dropped");
                    return;
                }
                self.emit(BrokerEvent::WorkerEvent {
                    payload: raw,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    async fn reply(&self, conn: &ConnectionId, frame: OutboundFrame) {
        let outbox = self.state.lock().await.registry.outbox(conn).cloned();
        match outbox {
            Some(outbox) => send(&outbox, frame, conn),
            None => debug!(conn_id = %conn, "Reply for closed connection dropped"),
        }
    }

    async fn is_registered(&self, conn: &ConnectionId) -> bool {
        self.state.lock().await.registry.is_registered(conn)
    }

    async fn on_register(&self, conn: &ConnectionId, req: &RegisterFrame) {
        let result = {
            let mut state = self.state.lock().await;
            let BrokerState { registry, channels } = &mut *state;
            registry::register(registry, channels, conn, req)
        };
        match result {
            Ok(identity) => {
                self.reply(
                    conn,
                    OutboundFrame::RegistrationSuccess {
                        client_id: identity.client_id.clone(),
                        channel_id: identity.channel_id.clone(),
                    },
                )
                .await;
                self.emit(BrokerEvent::ClientConnected {
                    client_id: identity.client_id,
                    role: identity.role,
                    channel_id: identity.channel_id,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                info!(conn_id = %conn, client_type = %req.client_type, "Registration refused: {e}");
                self.reply(
                    conn,
                    OutboundFrame::RegistrationError {
                        error: e.to_string(),
                        code: e.code(),
                    },
                )
                .await;
            }
        }
    }

    async fn on_create_channel(
        &self,
        conn: &ConnectionId,
        channel_id: Option<String>,
        channel_name: Option<String>,
    ) {
        let id = channel_id.clone().unwrap_or_default();
        let frame = match self.create_channel(&id, channel_name.as_deref()).await {
            Ok(summary) => OutboundFrame::ChannelCreated {
                channel_id: summary.id,
                channel_name: summary.name,
            },
            Err(e) => OutboundFrame::ChannelCreationError {
                channel_id,
                error: e.to_string(),
            },
        };
        self.reply(conn, frame).await;
    }

    async fn on_send_command(&self, conn: &ConnectionId, cmd: SendCommandFrame) {
        let command_id = cmd
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_command_id);

        let sender = {
            let state = self.state.lock().await;
            if state.registry.is_registered(conn) {
                state.registry.outbox(conn).cloned()
            } else {
                None
            }
        };
        let result = match sender {
            Some(outbox) => {
                self.dispatch_command(
                    cmd.channel_id.as_deref(),
                    Some(command_id.clone()),
                    &cmd.command,
                    cmd.params,
                    Some(outbox),
                )
                .await
            }
            None => Err(RoutingError::NotRegistered),
        };

        // Success needs no immediate reply; the outcome is relayed later.
        if let Err(e) = result {
            warn!(conn_id = %conn, command_id = %command_id, command = %cmd.command, "Command not routed: {e}");
            self.reply(
                conn,
                OutboundFrame::CommandError {
                    command_id,
                    error: e.to_string(),
                    code: Some(e.code().to_string()),
                    timestamp: Utc::now(),
                },
            )
            .await;
        }
    }

    async fn on_outcome(&self, conn: &ConnectionId, outcome: OutcomeFrame, success: bool) {
        let Some(command_id) = outcome.command_id().map(ToString::to_string) else {
            warn!(conn_id = %conn, "Command outcome without id dropped");
            return;
        };
        if !self.is_registered(conn).await {
            warn!(conn_id = %conn, command_id = %command_id, "Outcome from unregistered connection dropped");
            return;
        }

        if success {
            self.emit(BrokerEvent::CommandResult {
                command_id: command_id.clone(),
                result: outcome.result.clone(),
                timestamp: Utc::now(),
            });
            self.ledger.resolve(&command_id, outcome.result).await;
        } else {
            let message = outcome.error_message();
            self.emit(BrokerEvent::CommandFailed {
                command_id: command_id.clone(),
                error: message.clone(),
                timestamp: Utc::now(),
            });
            let failure = CommandFailure {
                message,
                code: outcome.code,
            };
            self.ledger.reject(&command_id, failure).await;
        }
    }

    // ─── In-process API ─────────────────────────────────────────────────────

    /// Create a channel and announce it to every connected socket.
    pub async fn create_channel(
        &self,
        id: &str,
        name: Option<&str>,
    ) -> Result<ChannelSummary, ChannelError> {
        let summary = {
            let mut state = self.state.lock().await;
            let summary = state.channels.create(id, name)?;
            let broadcast = OutboundFrame::ChannelCreatedBroadcast {
                channel_id: summary.id.clone(),
                channel_name: summary.name.clone(),
                timestamp: Utc::now(),
            };
            for (conn, outbox) in state.registry.outboxes() {
                send(outbox, broadcast.clone(), conn);
            }
            summary
        };
        info!(channel_id = %summary.id, channel_name = %summary.name, "Channel created");
        self.emit(BrokerEvent::ChannelCreated {
            channel_id: summary.id.clone(),
            channel_name: summary.name.clone(),
            timestamp: Utc::now(),
        });
        Ok(summary)
    }

    pub async fn list_channels(&self) -> Vec<ChannelSummary> {
        self.state.lock().await.channels.list()
    }

    pub async fn channel_exists(&self, id: &str) -> bool {
        self.state.lock().await.channels.contains(id)
    }

    /// Workers in `channel_id`, or across all channels when `None`.
    pub async fn worker_count(&self, channel_id: Option<&str>) -> usize {
        let state = self.state.lock().await;
        match channel_id.filter(|c| !c.is_empty()) {
            Some(cid) => state.channels.get(cid).map_or(0, |c| c.workers.len()),
            None => state.registry.worker_count(),
        }
    }

    /// Forward a command to the channel's worker and track it.
    ///
    /// `reply_to` receives the outcome frame when the sender is a remote
    /// connection. The returned [`Completion`] resolves either way.
    pub async fn dispatch_command(
        &self,
        channel_id: Option<&str>,
        command_id: Option<String>,
        command: &str,
        params: Value,
        reply_to: Option<Outbox>,
    ) -> Result<Completion, RoutingError> {
        let channel_id = channel_id
            .filter(|c| !c.is_empty())
            .ok_or(RoutingError::MissingChannelId)?;
        let command_id = command_id.unwrap_or_else(new_command_id);

        let mut state = self.state.lock().await;
        let Some(channel) = state.channels.get(channel_id) else {
            return Err(RoutingError::ChannelNotFound {
                channel_id: channel_id.to_string(),
                available: state.channels.ids(),
            });
        };
        if !channel.has_worker() {
            return Err(RoutingError::NoWorker(channel_id.to_string()));
        }
        let workers = channel.workers.clone();

        let completion = self
            .ledger
            .create(
                NewPending {
                    command_id: command_id.clone(),
                    command: command.to_string(),
                    channel_id: Some(channel_id.to_string()),
                    delivered_to: workers.clone(),
                    reply_to,
                },
                self.command_timeout,
            )
            .await?;

        let frame = OutboundFrame::Command {
            id: command_id.clone(),
            command: command.to_string(),
            params: params.clone(),
            timestamp: Utc::now(),
            channel_id: channel_id.to_string(),
        };
        let mut delivered = 0;
        for worker in &workers {
            if let Some(outbox) = state.registry.outbox(worker) {
                if outbox.try_send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        state.channels.touch(channel_id);
        drop(state);

        if delivered == 0 {
            warn!(command_id = %command_id, channel_id, "Worker queue unavailable, failing command");
            self.ledger
                .reject(
                    &command_id,
                    CommandFailure::with_code(
                        format!("Failed to deliver command to worker in channel {channel_id}"),
                        "DELIVERY_FAILED",
                    ),
                )
                .await;
            return Ok(completion);
        }

        info!(command_id = %command_id, command, channel_id, "Command forwarded to worker");
        self.emit(BrokerEvent::CommandDispatched {
            command_id,
            command: command.to_string(),
            params,
            channel_id: channel_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(completion)
    }

    /// Dispatch a command and wait for its outcome.
    pub async fn execute(
        &self,
        channel_id: &str,
        command: &str,
        params: Value,
    ) -> Result<Value, RelayError> {
        let completion = self
            .dispatch_command(Some(channel_id), None, command, params, None)
            .await?;
        completion.wait().await
    }

    pub async fn stats(&self) -> BrokerStats {
        let (channels, connections, workers) = {
            let state = self.state.lock().await;
            (
                state.channels.len(),
                state.registry.len(),
                state.registry.worker_count(),
            )
        };
        BrokerStats {
            channels,
            connections,
            workers,
            pending_commands: self.ledger.len().await,
        }
    }
}

/// Queue a frame without waiting. A full or closed queue drops the frame.
fn send(outbox: &Outbox, frame: OutboundFrame, conn: &ConnectionId) {
    if let Err(e) = outbox.try_send(frame) {
        warn!(conn_id = %conn, "Dropped outbound frame: {e}");
    }
}
