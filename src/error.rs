//! Error types for the broker and the relay client.
//!
//! Every error that crosses the wire has a stable upper-snake `code` so that
//! remote callers can branch on the kind without parsing the message text.

/// Why a `register` frame was refused. The connection stays open and
/// unregistered, so the caller may retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Channel \"{0}\" does not exist. Create the channel before registering to it.")]
    ChannelNotFound(String),
    #[error("Channel ID is required for {0} clients")]
    ChannelIdRequired(String),
    #[error("Channel \"{0}\" already has a worker connected. Only one worker per channel is allowed.")]
    WorkerSlotTaken(String),
    #[error("Connection is already registered as {0}")]
    AlreadyRegistered(String),
    #[error("Unknown client type \"{0}\"")]
    UnknownClientType(String),
    #[error("Unknown connection")]
    UnknownConnection,
}

impl RegistrationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            Self::ChannelIdRequired(_) => "CHANNEL_ID_REQUIRED",
            Self::WorkerSlotTaken(_) => "WORKER_SLOT_TAKEN",
            Self::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Self::UnknownClientType(_) => "UNKNOWN_CLIENT_TYPE",
            Self::UnknownConnection => "UNKNOWN_CONNECTION",
        }
    }
}

/// Channel table failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {0} already exists")]
    AlreadyExists(String),
    #[error("Channel ID is required")]
    EmptyId,
    #[error("Channel {0} not found")]
    NotFound(String),
    #[error("Channel {0} already has a worker")]
    WorkerSlotTaken(String),
}

/// A `send_command` that could not be delivered to a worker. Reported
/// synchronously; no pending entry is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("No channel ID provided")]
    MissingChannelId,
    #[error("Channel {channel_id} not found. Available channels: {available}")]
    ChannelNotFound { channel_id: String, available: String },
    #[error("No worker connected to channel {0}. Ensure the plugin is connected to this specific channel.")]
    NoWorker(String),
    #[error("Connection must register before sending commands")]
    NotRegistered,
    #[error("Command id {0} is already in flight")]
    DuplicateId(String),
}

impl RoutingError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingChannelId => "CHANNEL_ID_REQUIRED",
            Self::ChannelNotFound { .. } => "CHANNEL_NOT_FOUND",
            Self::NoWorker(_) => "NO_WORKER",
            Self::NotRegistered => "NOT_REGISTERED",
            Self::DuplicateId(_) => "DUPLICATE_COMMAND_ID",
        }
    }

    /// Rebuild a routing error relayed as `command_error`. The frame only
    /// carries code and message; the command's own channel and id fill in
    /// the rest.
    #[must_use]
    pub fn from_failure(failure: &CommandFailure, channel_id: &str, command_id: &str) -> Option<Self> {
        let routing = match failure.code.as_deref()? {
            "CHANNEL_ID_REQUIRED" => Self::MissingChannelId,
            "CHANNEL_NOT_FOUND" => Self::ChannelNotFound {
                channel_id: channel_id.to_string(),
                available: failure
                    .message
                    .split_once("Available channels: ")
                    .map(|(_, available)| available.to_string())
                    .unwrap_or_default(),
            },
            "NO_WORKER" => Self::NoWorker(channel_id.to_string()),
            "NOT_REGISTERED" => Self::NotRegistered,
            "DUPLICATE_COMMAND_ID" => Self::DuplicateId(command_id.to_string()),
            _ => return None,
        };
        Some(routing)
    }
}

/// Failure code for commands cut off because their relay went away.
pub const CONNECTION_CLOSED_CODE: &str = "CONNECTION_CLOSED";

/// Failure outcome of a pending command, as relayed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub message: String,
    pub code: Option<String>,
}

impl CommandFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    #[must_use]
    pub fn connection_closed() -> Self {
        Self::with_code("Connection closed", CONNECTION_CLOSED_CODE)
    }
}

/// Errors surfaced by the relay client (both modes) and by in-process
/// command execution on the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Socket-level failure: refused, closed mid-flight, reconnects exhausted.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("registration failed: {0}")]
    Registration(String),
    /// No correlated reply arrived in the configured window.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The worker (or the broker on its behalf) reported a failure.
    #[error("{message}")]
    Command { message: String, code: Option<String> },
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Map a failure outcome of the command `command_id` sent to
    /// `channel_id` back to an error kind. Timeouts and routing refusals stay
    /// distinct from worker-reported failures.
    #[must_use]
    pub fn from_failure(failure: CommandFailure, channel_id: Option<&str>, command_id: &str) -> Self {
        if let Some(routing) =
            RoutingError::from_failure(&failure, channel_id.unwrap_or_default(), command_id)
        {
            return Self::Routing(routing);
        }
        match failure.code.as_deref() {
            Some("TIMEOUT") => Self::Timeout(failure.message),
            Some(CONNECTION_CLOSED_CODE) => Self::Connection(failure.message),
            _ => Self::Command {
                message: failure.message,
                code: failure.code,
            },
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<RegistrationError> for RelayError {
    fn from(err: RegistrationError) -> Self {
        Self::Registration(err.to_string())
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid listen address {0}: expected host:port")]
    InvalidListen(String),
    #[error("refusing to listen on non-loopback address {0}")]
    NotLoopback(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_failure_maps_to_timeout_kind() {
        let err = RelayError::from_failure(CommandFailure::with_code("late", "TIMEOUT"), None, "a");
        assert!(err.is_timeout());
    }

    #[test]
    fn worker_failure_keeps_message_and_code() {
        let err = RelayError::from_failure(CommandFailure::new("node not found"), Some("c1"), "a");
        assert_eq!(
            err,
            RelayError::Command {
                message: "node not found".to_string(),
                code: None,
            }
        );
        assert_eq!(err.to_string(), "node not found");
    }

    #[test]
    fn relayed_routing_failures_keep_their_kind() {
        let no_worker = RoutingError::NoWorker("c1".into());
        let relayed = CommandFailure::with_code(no_worker.to_string(), no_worker.code());
        assert_eq!(
            RelayError::from_failure(relayed, Some("c1"), "a"),
            RelayError::Routing(no_worker)
        );

        let missing = RoutingError::ChannelNotFound {
            channel_id: "ghost".into(),
            available: "c1, c2".into(),
        };
        let relayed = CommandFailure::with_code(missing.to_string(), missing.code());
        assert_eq!(
            RelayError::from_failure(relayed, Some("ghost"), "a"),
            RelayError::Routing(missing)
        );

        let relayed = CommandFailure::with_code("in flight", "DUPLICATE_COMMAND_ID");
        assert_eq!(
            RelayError::from_failure(relayed, Some("c1"), "a"),
            RelayError::Routing(RoutingError::DuplicateId("a".into()))
        );
    }

    #[test]
    fn connection_closed_maps_to_connection_kind() {
        let err = RelayError::from_failure(CommandFailure::connection_closed(), Some("c1"), "a");
        assert!(matches!(err, RelayError::Connection(_)));
    }

    #[test]
    fn registration_codes_are_stable() {
        assert_eq!(
            RegistrationError::WorkerSlotTaken("c1".into()).code(),
            "WORKER_SLOT_TAKEN"
        );
        assert_eq!(
            RegistrationError::ChannelNotFound("c1".into()).code(),
            "CHANNEL_NOT_FOUND"
        );
    }
}
