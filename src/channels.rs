//! Channel table — named routing groups pairing at most one worker with any
//! number of controllers.
//!
//! Channels are only created by explicit request; registering into a missing
//! channel fails instead of creating it. Listing preserves insertion order.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::error::ChannelError;
use crate::protocol::{ChannelSummary, Role};
use crate::registry::ConnectionId;

/// One channel and its current membership.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub name: String,
    /// Worker connection, kept as a list for symmetry; never longer than 1.
    pub workers: Vec<ConnectionId>,
    pub controllers: Vec<ConnectionId>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Channel {
    fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            workers: Vec::new(),
            controllers: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    #[must_use]
    pub fn has_worker(&self) -> bool {
        !self.workers.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            worker_count: self.workers.len(),
            controller_count: self.controllers.len(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// All channels known to one broker.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: IndexMap<String, Channel>,
}

impl ChannelTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel. The id is caller-supplied; the name defaults to it.
    pub fn create(&mut self, id: &str, name: Option<&str>) -> Result<ChannelSummary, ChannelError> {
        if id.is_empty() {
            return Err(ChannelError::EmptyId);
        }
        if self.channels.contains_key(id) {
            return Err(ChannelError::AlreadyExists(id.to_string()));
        }
        let name = name.filter(|n| !n.is_empty()).unwrap_or(id);
        let channel = Channel::new(id.to_string(), name.to_string());
        let summary = channel.summary();
        self.channels.insert(id.to_string(), channel);
        Ok(summary)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Snapshot of every channel, in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<ChannelSummary> {
        self.channels.values().map(Channel::summary).collect()
    }

    /// Comma-separated channel ids, used in routing error messages.
    #[must_use]
    pub fn ids(&self) -> String {
        self.channels
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Add a connection to a channel. Listing connections never join.
    pub fn add_member(
        &mut self,
        channel_id: &str,
        conn: &ConnectionId,
        role: Role,
    ) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::NotFound(channel_id.to_string()))?;
        match role {
            Role::Worker => {
                if channel.workers.iter().any(|w| w != conn) {
                    return Err(ChannelError::WorkerSlotTaken(channel_id.to_string()));
                }
                if !channel.workers.contains(conn) {
                    channel.workers.push(conn.clone());
                }
            }
            Role::Controller => {
                if !channel.controllers.contains(conn) {
                    channel.controllers.push(conn.clone());
                }
            }
            Role::Listing => return Ok(()),
        }
        channel.last_activity = Utc::now();
        Ok(())
    }

    /// Remove a connection from a channel. Missing channel or member is a
    /// no-op. Returns whether anything was removed.
    pub fn remove_member(&mut self, channel_id: &str, conn: &ConnectionId, role: Role) -> bool {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let list = match role {
            Role::Worker => &mut channel.workers,
            Role::Controller => &mut channel.controllers,
            Role::Listing => return false,
        };
        let before = list.len();
        list.retain(|c| c != conn);
        let removed = list.len() != before;
        if removed {
            channel.last_activity = Utc::now();
        }
        removed
    }

    /// Record command traffic through a channel.
    pub fn touch(&mut self, channel_id: &str) {
        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.last_activity = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn create_defaults_name_to_id() {
        let mut table = ChannelTable::new();
        let summary = table.create("c1", None).unwrap();
        assert_eq!(summary.name, "c1");
        assert_eq!(summary.worker_count, 0);
        let named = table.create("c2", Some("Design review")).unwrap();
        assert_eq!(named.name, "Design review");
    }

    #[test]
    fn create_rejects_duplicates_and_empty_ids() {
        let mut table = ChannelTable::new();
        table.create("c1", None).unwrap();
        assert_eq!(
            table.create("c1", Some("again")),
            Err(ChannelError::AlreadyExists("c1".into()))
        );
        assert_eq!(table.create("", None), Err(ChannelError::EmptyId));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut table = ChannelTable::new();
        for id in ["zeta", "alpha", "mid"] {
            table.create(id, None).unwrap();
        }
        let ids: Vec<String> = table.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
        assert_eq!(table.ids(), "zeta, alpha, mid");
    }

    #[test]
    fn second_worker_is_rejected() {
        let mut table = ChannelTable::new();
        table.create("c1", None).unwrap();
        table.add_member("c1", &conn("a"), Role::Worker).unwrap();
        assert_eq!(
            table.add_member("c1", &conn("b"), Role::Worker),
            Err(ChannelError::WorkerSlotTaken("c1".into()))
        );
        assert_eq!(table.get("c1").unwrap().workers, vec![conn("a")]);

        assert!(table.remove_member("c1", &conn("a"), Role::Worker));
        table.add_member("c1", &conn("b"), Role::Worker).unwrap();
        assert_eq!(table.get("c1").unwrap().workers, vec![conn("b")]);
    }

    #[test]
    fn listing_role_never_counts() {
        let mut table = ChannelTable::new();
        table.create("c1", None).unwrap();
        table.add_member("c1", &conn("l"), Role::Listing).unwrap();
        let summary = &table.list()[0];
        assert_eq!(summary.worker_count, 0);
        assert_eq!(summary.controller_count, 0);
    }

    #[test]
    fn remove_missing_member_is_noop() {
        let mut table = ChannelTable::new();
        table.create("c1", None).unwrap();
        table.add_member("c1", &conn("x"), Role::Controller).unwrap();
        assert!(!table.remove_member("c1", &conn("y"), Role::Controller));
        assert!(!table.remove_member("nope", &conn("x"), Role::Controller));
        assert_eq!(table.get("c1").unwrap().controllers.len(), 1);
    }

    #[test]
    fn add_member_to_missing_channel_fails() {
        let mut table = ChannelTable::new();
        assert_eq!(
            table.add_member("ghost", &conn("x"), Role::Controller),
            Err(ChannelError::NotFound("ghost".into()))
        );
        assert!(!table.contains("ghost"));
    }
}
