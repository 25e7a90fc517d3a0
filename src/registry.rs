//! Connection registry — every live socket and the identity it registered.
//!
//! A connection is attached on accept (unregistered), gains an [`Identity`]
//! on its first successful `register`, and is removed on close. Registration
//! consults the [`ChannelTable`] but never creates channels.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channels::ChannelTable;
use crate::error::{ChannelError, RegistrationError};
use crate::protocol::{OutboundFrame, RegisterFrame, Role};

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<OutboundFrame>;

/// Opaque per-socket id, assigned on accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a connection declared about itself in `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub role: Role,
    pub channel_id: Option<String>,
}

struct ConnectionEntry {
    outbox: Outbox,
    identity: Option<Identity>,
    connected_at: Instant,
}

/// Outcome of [`unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The connection was not (or no longer) known.
    Unknown,
    /// The connection closed without ever registering.
    Anonymous,
    Registered(Identity),
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted socket.
    pub fn attach(&mut self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::generate();
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                outbox,
                identity: None,
                connected_at: Instant::now(),
            },
        );
        id
    }

    #[must_use]
    pub fn identity(&self, conn: &ConnectionId) -> Option<&Identity> {
        self.connections.get(conn)?.identity.as_ref()
    }

    #[must_use]
    pub fn outbox(&self, conn: &ConnectionId) -> Option<&Outbox> {
        self.connections.get(conn).map(|e| &e.outbox)
    }

    #[must_use]
    pub fn is_registered(&self, conn: &ConnectionId) -> bool {
        self.identity(conn).is_some()
    }

    /// Every connection's outbox, registered or not (for broadcasts).
    pub fn outboxes(&self) -> impl Iterator<Item = (&ConnectionId, &Outbox)> {
        self.connections.iter().map(|(id, e)| (id, &e.outbox))
    }

    /// Number of registered workers across all channels.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.connections
            .values()
            .filter(|e| matches!(&e.identity, Some(i) if i.role == Role::Worker))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Register a connection into a role and (optionally) a channel.
///
/// - `Worker` / `Controller` need an existing channel.
/// - `Listing` may omit the channel; with one, it still never joins counts.
/// - A second worker for a channel is refused and the first stays in place.
pub fn register(
    registry: &mut ConnectionRegistry,
    channels: &mut ChannelTable,
    conn: &ConnectionId,
    request: &RegisterFrame,
) -> Result<Identity, RegistrationError> {
    let entry = registry
        .connections
        .get_mut(conn)
        .ok_or(RegistrationError::UnknownConnection)?;
    if let Some(existing) = &entry.identity {
        return Err(RegistrationError::AlreadyRegistered(
            existing.role.to_string(),
        ));
    }

    let role = Role::from_wire(&request.client_type)
        .ok_or_else(|| RegistrationError::UnknownClientType(request.client_type.clone()))?;
    let channel_id = request.channel_id.clone().filter(|c| !c.is_empty());

    match &channel_id {
        Some(cid) => {
            channels.add_member(cid, conn, role).map_err(|e| match e {
                ChannelError::WorkerSlotTaken(c) => RegistrationError::WorkerSlotTaken(c),
                _ => RegistrationError::ChannelNotFound(cid.clone()),
            })?;
        }
        None if role == Role::Listing => {}
        None => return Err(RegistrationError::ChannelIdRequired(role.to_string())),
    }

    let identity = Identity {
        client_id: request
            .client_id
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("client_{conn}")),
        role,
        channel_id,
    };
    entry.identity = Some(identity.clone());
    info!(
        conn_id = %conn,
        client_id = %identity.client_id,
        role = %identity.role,
        channel_id = identity.channel_id.as_deref().unwrap_or("none"),
        "Client registered"
    );
    Ok(identity)
}

/// Remove a connection and its channel membership. Safe to call repeatedly.
pub fn unregister(
    registry: &mut ConnectionRegistry,
    channels: &mut ChannelTable,
    conn: &ConnectionId,
) -> Departure {
    let Some(entry) = registry.connections.remove(conn) else {
        debug!(conn_id = %conn, "Unregister for unknown connection (no-op)");
        return Departure::Unknown;
    };
    let connected_secs = entry.connected_at.elapsed().as_secs();
    let Some(identity) = entry.identity else {
        info!(conn_id = %conn, connected_secs, "Unregistered client disconnected");
        return Departure::Anonymous;
    };
    if let Some(cid) = &identity.channel_id {
        channels.remove_member(cid, conn, identity.role);
    }
    info!(
        conn_id = %conn,
        client_id = %identity.client_id,
        role = %identity.role,
        channel_id = identity.channel_id.as_deref().unwrap_or("none"),
        connected_secs,
        "Client disconnected"
    );
    Departure::Registered(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<OutboundFrame>) {
        mpsc::channel(8)
    }

    fn req(client_type: &str, channel: Option<&str>) -> RegisterFrame {
        RegisterFrame {
            client_type: client_type.to_string(),
            client_id: None,
            channel_id: channel.map(ToString::to_string),
        }
    }

    fn setup() -> (ConnectionRegistry, ChannelTable) {
        let mut channels = ChannelTable::new();
        channels.create("c1", None).unwrap();
        (ConnectionRegistry::new(), channels)
    }

    #[test]
    fn at_most_one_worker_per_channel() {
        let (mut reg, mut channels) = setup();
        let (tx_a, _rx_a) = outbox();
        let (tx_b, _rx_b) = outbox();
        let a = reg.attach(tx_a);
        let b = reg.attach(tx_b);

        register(&mut reg, &mut channels, &a, &req("figma", Some("c1"))).unwrap();
        let err = register(&mut reg, &mut channels, &b, &req("figma", Some("c1"))).unwrap_err();
        assert_eq!(err, RegistrationError::WorkerSlotTaken("c1".into()));
        assert!(!reg.is_registered(&b));
        assert_eq!(channels.get("c1").unwrap().workers, vec![a.clone()]);

        unregister(&mut reg, &mut channels, &a);
        register(&mut reg, &mut channels, &b, &req("figma", Some("c1"))).unwrap();
        assert_eq!(channels.get("c1").unwrap().workers, vec![b]);
    }

    #[test]
    fn missing_channel_is_not_created() {
        let (mut reg, mut channels) = setup();
        let (tx, _rx) = outbox();
        let c = reg.attach(tx);
        let err = register(&mut reg, &mut channels, &c, &req("n8n", Some("ghost"))).unwrap_err();
        assert_eq!(err, RegistrationError::ChannelNotFound("ghost".into()));
        assert!(channels.list().iter().all(|ch| ch.id != "ghost"));
        assert!(!reg.is_registered(&c));
    }

    #[test]
    fn channel_id_required_except_for_listing() {
        let (mut reg, mut channels) = setup();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();
        let ctl = reg.attach(tx1);
        let lst = reg.attach(tx2);
        assert_eq!(
            register(&mut reg, &mut channels, &ctl, &req("n8n", None)).unwrap_err(),
            RegistrationError::ChannelIdRequired("n8n".into())
        );
        let identity = register(&mut reg, &mut channels, &lst, &req("n8n_get_channels", None)).unwrap();
        assert_eq!(identity.role, Role::Listing);
        assert_eq!(identity.channel_id, None);
    }

    #[test]
    fn listing_connection_never_counted() {
        let (mut reg, mut channels) = setup();
        let (tx, _rx) = outbox();
        let lst = reg.attach(tx);
        register(&mut reg, &mut channels, &lst, &req("n8n_get_channels", Some("c1"))).unwrap();
        let summary = &channels.list()[0];
        assert_eq!(summary.worker_count + summary.controller_count, 0);
    }

    #[test]
    fn second_register_on_same_connection_rejected() {
        let (mut reg, mut channels) = setup();
        let (tx, _rx) = outbox();
        let c = reg.attach(tx);
        register(&mut reg, &mut channels, &c, &req("n8n", Some("c1"))).unwrap();
        let err = register(&mut reg, &mut channels, &c, &req("figma", Some("c1"))).unwrap_err();
        assert_eq!(err, RegistrationError::AlreadyRegistered("n8n".into()));
        assert_eq!(channels.get("c1").unwrap().controllers.len(), 1);
        assert!(channels.get("c1").unwrap().workers.is_empty());
    }

    #[test]
    fn unknown_client_type_rejected() {
        let (mut reg, mut channels) = setup();
        let (tx, _rx) = outbox();
        let c = reg.attach(tx);
        let err = register(&mut reg, &mut channels, &c, &req("toaster", Some("c1"))).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_CLIENT_TYPE");
    }

    #[test]
    fn unregister_is_idempotent() {
        let (mut reg, mut channels) = setup();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();
        let ctl = reg.attach(tx1);
        let anon = reg.attach(tx2);
        register(&mut reg, &mut channels, &ctl, &req("n8n", Some("c1"))).unwrap();

        assert!(matches!(
            unregister(&mut reg, &mut channels, &ctl),
            Departure::Registered(_)
        ));
        assert_eq!(unregister(&mut reg, &mut channels, &ctl), Departure::Unknown);
        assert_eq!(unregister(&mut reg, &mut channels, &anon), Departure::Anonymous);
        assert_eq!(unregister(&mut reg, &mut channels, &anon), Departure::Unknown);

        let summary = &channels.list()[0];
        assert_eq!(summary.controller_count, 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn generated_client_id_when_missing() {
        let (mut reg, mut channels) = setup();
        let (tx, _rx) = outbox();
        let c = reg.attach(tx);
        let identity = register(&mut reg, &mut channels, &c, &req("n8n", Some("c1"))).unwrap();
        assert!(identity.client_id.starts_with("client_"));
    }
}
