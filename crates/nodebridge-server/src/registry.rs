//! Connection registry: the gateway's shared mutable state.
//!
//! Tracks the backend connection per channel, the ordered list of
//! subscribed sessions per channel, and the per-user open-connection
//! counters. The registry is owned outright by the gateway event loop and
//! is never touched from any other task, so it needs no locking; mutual
//! exclusion is structural.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;

use nodebridge_core::BackendKind;

use crate::backend::Backend;
use crate::gateway::SessionOutput;

/// Process-monotonic identifier of one WebSocket session.
pub type SessionId = u64;

/// Registry key for a backend connection and its subscriber list.
///
/// Serial consoles are shared: every session for a node joins the same
/// channel and the backend is broadcast to all of them. SSH shells are
/// private: the key embeds the session id, so each SSH session owns its
/// own backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Serial { node: String },
    Ssh { node: String, session: SessionId },
}

impl ChannelKey {
    pub fn node(&self) -> &str {
        match self {
            ChannelKey::Serial { node } => node,
            ChannelKey::Ssh { node, .. } => node,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ChannelKey::Serial { .. } => BackendKind::Serial,
            ChannelKey::Ssh { .. } => BackendKind::Ssh,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Serial { node } => write!(f, "serial:{node}"),
            ChannelKey::Ssh { node, session } => write!(f, "ssh:{node}#{session}"),
        }
    }
}

/// One admitted session as tracked by the registry.
pub struct SessionEntry {
    pub id: SessionId,
    pub user: String,
    /// Relay backend data to this session as binary frames (raw serial and
    /// SSH); text sessions get the lossy UTF-8 decode instead.
    pub binary: bool,
    pub out: mpsc::UnboundedSender<SessionOutput>,
}

/// The gateway's connection table.
#[derive(Default)]
pub struct ConnectionRegistry {
    backends: HashMap<ChannelKey, Box<dyn Backend>>,
    subscribers: HashMap<ChannelKey, Vec<SessionEntry>>,
    index: HashMap<SessionId, ChannelKey>,
    user_counts: HashMap<String, usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_backend(&self, key: &ChannelKey) -> bool {
        self.backends.contains_key(key)
    }

    pub fn backend(&self, key: &ChannelKey) -> Option<&dyn Backend> {
        self.backends.get(key).map(|b| b.as_ref())
    }

    pub fn backend_mut(&mut self, key: &ChannelKey) -> Option<&mut Box<dyn Backend>> {
        self.backends.get_mut(key)
    }

    pub fn insert_backend(&mut self, key: ChannelKey, backend: Box<dyn Backend>) {
        self.backends.insert(key, backend);
    }

    pub fn remove_backend(&mut self, key: &ChannelKey) -> Option<Box<dyn Backend>> {
        self.backends.remove(key)
    }

    /// Number of sessions currently subscribed to a channel.
    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.subscribers.get(key).map_or(0, Vec::len)
    }

    /// Number of sessions currently open for a user.
    pub fn user_count(&self, user: &str) -> usize {
        self.user_counts.get(user).copied().unwrap_or(0)
    }

    pub fn subscribers(&self, key: &ChannelKey) -> &[SessionEntry] {
        self.subscribers.get(key).map_or(&[], Vec::as_slice)
    }

    /// The channel a session is subscribed to, if it is still tracked.
    pub fn key_of(&self, id: SessionId) -> Option<&ChannelKey> {
        self.index.get(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.index.keys().copied().collect()
    }

    /// Admit a session: append it to the channel's subscriber list and
    /// bump the owning user's counter.
    pub fn add_session(&mut self, key: ChannelKey, entry: SessionEntry) {
        *self.user_counts.entry(entry.user.clone()).or_insert(0) += 1;
        self.index.insert(entry.id, key.clone());
        self.subscribers.entry(key).or_default().push(entry);
    }

    /// Remove a session from its channel. Tolerates double close: removing
    /// an unknown session is a no-op and never decrements a counter below
    /// zero.
    pub fn remove_session(&mut self, id: SessionId) -> Option<(ChannelKey, SessionEntry)> {
        let key = self.index.remove(&id)?;
        let list = self.subscribers.get_mut(&key)?;
        let pos = list.iter().position(|entry| entry.id == id)?;
        let entry = list.remove(pos);
        if list.is_empty() {
            self.subscribers.remove(&key);
        }
        self.decrement_user(&entry.user);
        Some((key, entry))
    }

    /// Drain every subscriber of a channel, updating index and counters.
    /// Used when a backend connection closes underneath its sessions.
    pub fn take_subscribers(&mut self, key: &ChannelKey) -> Vec<SessionEntry> {
        let entries = self.subscribers.remove(key).unwrap_or_default();
        for entry in &entries {
            self.index.remove(&entry.id);
            self.decrement_user(&entry.user);
        }
        entries
    }

    fn decrement_user(&mut self, user: &str) {
        if let Some(count) = self.user_counts.get_mut(user) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.user_counts.remove(user);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend {
        ready: bool,
    }

    impl Backend for NullBackend {
        fn is_ready(&self) -> bool {
            self.ready
        }
        fn set_ready(&mut self, ready: bool) {
            self.ready = ready;
        }
        fn send(&mut self, _payload: &[u8]) {}
        fn stop(&mut self) {}
    }

    fn serial_key(node: &str) -> ChannelKey {
        ChannelKey::Serial {
            node: node.to_string(),
        }
    }

    fn entry(id: SessionId, user: &str) -> SessionEntry {
        let (out, _rx) = mpsc::unbounded_channel();
        SessionEntry {
            id,
            user: user.to_string(),
            binary: false,
            out,
        }
    }

    #[test]
    fn counts_follow_sessions() {
        let mut registry = ConnectionRegistry::new();
        let key = serial_key("m3-1");

        registry.add_session(key.clone(), entry(1, "alice"));
        registry.add_session(key.clone(), entry(2, "alice"));
        assert_eq!(registry.subscriber_count(&key), 2);
        assert_eq!(registry.user_count("alice"), 2);

        let (removed_key, removed) = registry.remove_session(1).unwrap();
        assert_eq!(removed_key, key);
        assert_eq!(removed.id, 1);
        assert_eq!(registry.subscriber_count(&key), 1);
        assert_eq!(registry.user_count("alice"), 1);
    }

    #[test]
    fn double_close_is_a_noop() {
        let mut registry = ConnectionRegistry::new();
        let key = serial_key("m3-1");
        registry.add_session(key.clone(), entry(1, "alice"));

        assert!(registry.remove_session(1).is_some());
        assert!(registry.remove_session(1).is_none());
        assert_eq!(registry.user_count("alice"), 0);
    }

    #[test]
    fn sessions_span_nodes_for_one_user() {
        let mut registry = ConnectionRegistry::new();
        registry.add_session(serial_key("m3-1"), entry(1, "alice"));
        registry.add_session(serial_key("m3-2"), entry(2, "alice"));
        assert_eq!(registry.user_count("alice"), 2);

        registry.remove_session(2);
        assert_eq!(registry.user_count("alice"), 1);
    }

    #[test]
    fn take_subscribers_drains_channel() {
        let mut registry = ConnectionRegistry::new();
        let key = serial_key("m3-1");
        registry.add_session(key.clone(), entry(1, "alice"));
        registry.add_session(key.clone(), entry(2, "bob"));

        let drained = registry.take_subscribers(&key);
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.subscriber_count(&key), 0);
        assert_eq!(registry.user_count("alice"), 0);
        assert_eq!(registry.user_count("bob"), 0);
        assert!(registry.key_of(1).is_none());
        // Draining again is harmless.
        assert!(registry.take_subscribers(&key).is_empty());
    }

    #[test]
    fn backend_slots_are_per_key() {
        let mut registry = ConnectionRegistry::new();
        let key = serial_key("m3-1");
        registry.insert_backend(key.clone(), Box::new(NullBackend { ready: false }));
        assert!(registry.has_backend(&key));
        assert!(!registry.backend(&key).unwrap().is_ready());

        registry.backend_mut(&key).unwrap().set_ready(true);
        assert!(registry.backend(&key).unwrap().is_ready());

        assert!(registry.remove_backend(&key).is_some());
        assert!(!registry.has_backend(&key));
        assert!(registry.remove_backend(&key).is_none());
    }

    #[test]
    fn ssh_keys_embed_the_session() {
        let a = ChannelKey::Ssh {
            node: "a8-1".to_string(),
            session: 1,
        };
        let b = ChannelKey::Ssh {
            node: "a8-1".to_string(),
            session: 2,
        };
        assert_ne!(a, b);
        assert_eq!(a.node(), b.node());
        assert_eq!(a.kind(), BackendKind::Ssh);
    }
}
