//! Pending-command ledger — correlates asynchronously arriving outcomes with
//! the request that caused them, and bounds how long each may wait.
//!
//! Each entry is resolved exactly once: by [`PendingLedger::resolve`], by
//! [`PendingLedger::reject`], or by its timeout timer. Whichever removes the
//! entry from the map first wins; later triggers for the same id are no-ops.
//!
//! The broker keeps one ledger for worker-bound commands (entries carry the
//! sender's outbox so the outcome is relayed back over the wire); the remote
//! relay client keeps its own for the round trip to the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CommandFailure, RelayError, RoutingError};
use crate::protocol::OutboundFrame;
use crate::registry::{ConnectionId, Outbox};

/// Final outcome delivered to an in-process waiter.
pub type CommandOutcome = Result<Value, CommandFailure>;

/// Failure code used when the timer fires.
pub const TIMEOUT_CODE: &str = "TIMEOUT";

/// Fresh command id: a random uuid v4, never a counter.
#[must_use]
pub fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Details of a command about to be tracked.
#[derive(Debug, Clone, Default)]
pub struct NewPending {
    pub command_id: String,
    pub command: String,
    pub channel_id: Option<String>,
    /// Worker connections the command frame was written to.
    pub delivered_to: Vec<ConnectionId>,
    /// Connection to relay the outcome frame to, if the sender is remote.
    pub reply_to: Option<Outbox>,
}

struct PendingCommand {
    command: String,
    channel_id: Option<String>,
    delivered_to: Vec<ConnectionId>,
    reply_to: Option<Outbox>,
    waiter: oneshot::Sender<CommandOutcome>,
    created_at: Instant,
    timer: JoinHandle<()>,
}

impl PendingCommand {
    /// Relay the outcome to the sender connection and complete the waiter.
    fn complete(self, command_id: &str, outcome: CommandOutcome) {
        self.timer.abort();
        if let Some(outbox) = &self.reply_to {
            let frame = match &outcome {
                Ok(result) => OutboundFrame::CommandResult {
                    command_id: command_id.to_string(),
                    result: result.clone(),
                    timestamp: Utc::now(),
                },
                Err(failure) => OutboundFrame::CommandError {
                    command_id: command_id.to_string(),
                    error: failure.message.clone(),
                    code: failure.code.clone(),
                    timestamp: Utc::now(),
                },
            };
            if outbox.try_send(frame).is_err() {
                warn!(command_id, "Sender connection gone or backlogged, outcome not relayed");
            }
        }
        debug!(
            command_id,
            command = %self.command,
            channel_id = self.channel_id.as_deref().unwrap_or("none"),
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Pending command completed"
        );
        // The waiter may have been dropped; that's fine.
        let _ = self.waiter.send(outcome);
    }
}

/// Handle to await a tracked command's outcome.
#[derive(Debug)]
pub struct Completion {
    command_id: String,
    channel_id: Option<String>,
    rx: oneshot::Receiver<CommandOutcome>,
}

impl Completion {
    #[must_use]
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Wait for the outcome. Timeouts surface as [`RelayError::Timeout`].
    pub async fn wait(self) -> Result<Value, RelayError> {
        match self.rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(failure)) => Err(RelayError::from_failure(
                failure,
                self.channel_id.as_deref(),
                &self.command_id,
            )),
            Err(_) => Err(RelayError::Connection(format!(
                "pending command {} was dropped",
                self.command_id
            ))),
        }
    }
}

/// Shared, cloneable ledger of in-flight commands keyed by command id.
#[derive(Clone)]
pub struct PendingLedger {
    entries: Arc<Mutex<HashMap<String, PendingCommand>>>,
    label: &'static str,
}

impl PendingLedger {
    /// `label` tags log lines (`"broker"`, `"client"`).
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            label,
        }
    }

    /// Track a command. The entry is auto-rejected with a timeout failure if
    /// nothing resolves it within `timeout`.
    pub async fn create(
        &self,
        pending: NewPending,
        timeout: Duration,
    ) -> Result<Completion, RoutingError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&pending.command_id) {
            return Err(RoutingError::DuplicateId(pending.command_id));
        }

        let (tx, rx) = oneshot::channel();
        // Spawned while the lock is held, so the timer cannot observe the map
        // before the entry exists.
        let ledger = self.clone();
        let id = pending.command_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ledger.expire(&id, timeout).await;
        });

        entries.insert(
            pending.command_id.clone(),
            PendingCommand {
                command: pending.command,
                channel_id: pending.channel_id.clone(),
                delivered_to: pending.delivered_to,
                reply_to: pending.reply_to,
                waiter: tx,
                created_at: Instant::now(),
                timer,
            },
        );
        debug!(ledger = self.label, command_id = %pending.command_id, "Pending command created");

        Ok(Completion {
            command_id: pending.command_id,
            channel_id: pending.channel_id,
            rx,
        })
    }

    /// Complete a command successfully. Returns `false` (and logs) when no
    /// entry exists, e.g. a late reply after timeout.
    pub async fn resolve(&self, command_id: &str, result: Value) -> bool {
        let entry = self.entries.lock().await.remove(command_id);
        match entry {
            Some(entry) => {
                entry.complete(command_id, Ok(result));
                true
            }
            None => {
                self.log_unknown(command_id, "result").await;
                false
            }
        }
    }

    /// Complete a command with a failure. Same semantics as [`Self::resolve`].
    pub async fn reject(&self, command_id: &str, failure: CommandFailure) -> bool {
        let entry = self.entries.lock().await.remove(command_id);
        match entry {
            Some(entry) => {
                entry.complete(command_id, Err(failure));
                true
            }
            None => {
                self.log_unknown(command_id, "error").await;
                false
            }
        }
    }

    /// Fail every command that was delivered to `worker`. Returns how many.
    pub async fn reject_delivered_to(&self, worker: &ConnectionId, failure: &CommandFailure) -> usize {
        let drained: Vec<(String, PendingCommand)> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.delivered_to.contains(worker))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let count = drained.len();
        for (id, entry) in drained {
            entry.complete(&id, Err(failure.clone()));
        }
        count
    }

    /// Fail every pending command (local cleanup on disconnect).
    pub async fn reject_all(&self, failure: &CommandFailure) -> usize {
        let drained: Vec<(String, PendingCommand)> =
            self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.complete(&id, Err(failure.clone()));
        }
        count
    }

    pub async fn contains(&self, command_id: &str) -> bool {
        self.entries.lock().await.contains_key(command_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn expire(&self, command_id: &str, timeout: Duration) {
        let Some(entry) = self.entries.lock().await.remove(command_id) else {
            return;
        };
        warn!(
            ledger = self.label,
            command_id,
            command = %entry.command,
            timeout_ms = timeout.as_millis() as u64,
            "Command timed out"
        );
        let failure =
            CommandFailure::with_code(format!("Command timeout: {}", entry.command), TIMEOUT_CODE);
        entry.complete(command_id, Err(failure));
    }

    async fn log_unknown(&self, command_id: &str, kind: &str) {
        let pending = self.entries.lock().await.len();
        warn!(
            ledger = self.label,
            command_id,
            kind,
            pending,
            "No pending command for id (late or unknown reply dropped)"
        );
    }
}
