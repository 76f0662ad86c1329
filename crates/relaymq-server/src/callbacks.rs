//! Registry of client callback channels for topology pushes.

use dashmap::DashMap;
use relaymq_core::{ClientInstanceId, SessionId};

use crate::dispatcher::PacketSender;

/// Key of a callback registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    pub client_instance_id: ClientInstanceId,
    pub session_id: SessionId,
}

impl CallbackKey {
    pub fn new(client_instance_id: ClientInstanceId, session_id: SessionId) -> Self {
        Self {
            client_instance_id,
            session_id,
        }
    }
}

/// A registered push channel and the wire version its session speaks.
#[derive(Debug, Clone)]
pub struct CallbackChannel {
    sender: PacketSender,
    wire_version: u8,
}

impl CallbackChannel {
    pub fn new(sender: PacketSender, wire_version: u8) -> Self {
        Self {
            sender,
            wire_version,
        }
    }

    pub fn sender(&self) -> &PacketSender {
        &self.sender
    }

    pub fn wire_version(&self) -> u8 {
        self.wire_version
    }
}

/// Callback channels of one connection factory.
///
/// Mutations may race with an in-flight publish; the publisher works on a
/// [`snapshot`](Self::snapshot) and re-checks membership before each send.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    channels: DashMap<CallbackKey, CallbackChannel>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a channel. Returns the replaced one, if any.
    pub fn insert(&self, key: CallbackKey, channel: CallbackChannel) -> Option<CallbackChannel> {
        self.channels.insert(key, channel)
    }

    /// Removes a channel. Returns true if it was present.
    pub fn remove(&self, key: &CallbackKey) -> bool {
        self.channels.remove(key).is_some()
    }

    /// Removes every channel belonging to a session.
    pub fn remove_session(&self, session_id: &SessionId) -> usize {
        let before = self.channels.len();
        self.channels.retain(|key, _| &key.session_id != session_id);
        before.saturating_sub(self.channels.len())
    }

    pub fn contains(&self, key: &CallbackKey) -> bool {
        self.channels.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Copies the current registrations out of the map.
    pub fn snapshot(&self) -> Vec<(CallbackKey, CallbackChannel)> {
        self.channels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(session: &str) -> CallbackChannel {
        let (sender, _rx) = PacketSender::channel(SessionId::new(session), 1);
        CallbackChannel::new(sender, 1)
    }

    fn key(client: &str, session: &str) -> CallbackKey {
        CallbackKey::new(ClientInstanceId::new(client), SessionId::new(session))
    }

    #[test]
    fn insert_replaces_same_key() {
        let registry = CallbackRegistry::new();
        assert!(registry.insert(key("vm-1", "s1"), channel("s1")).is_none());
        assert!(registry.insert(key("vm-1", "s1"), channel("s1")).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_session_drops_only_that_session() {
        let registry = CallbackRegistry::new();
        registry.insert(key("vm-1", "s1"), channel("s1"));
        registry.insert(key("vm-2", "s1"), channel("s1"));
        registry.insert(key("vm-1", "s2"), channel("s2"));

        assert_eq!(registry.remove_session(&SessionId::new("s1")), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&key("vm-1", "s2")));
        assert!(!registry.remove(&key("vm-1", "s1")));
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry = CallbackRegistry::new();
        registry.insert(key("vm-1", "s1"), channel("s1"));
        let snapshot = registry.snapshot();
        registry.remove(&key("vm-1", "s1"));
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }
}
