//! Session-correlation state shared across messages.
//!
//! Handshake messages open a session that later data messages refer to by key
//! id. Both indexes are bounded: when full, the oldest entry is evicted.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::element::HandshakeStage;

/// Insertion-ordered map with a fixed capacity.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    /// Creates a map holding at most `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Inserts or replaces a value. Returns the evicted entry, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.insert(key.clone(), value).is_some() {
            return None;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            let value = self.entries.remove(&oldest)?;
            return Some((oldest, value));
        }
        None
    }

    /// Looks up a value.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A correlated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VauSession {
    /// Session id (hex SHA-256 of the opening handshake message).
    pub id: String,
    /// Key id announced by the server, once seen.
    pub key_id: Option<String>,
    /// Most recent handshake stage observed.
    pub stage: HandshakeStage,
}

/// Run-wide session indexes.
#[derive(Debug)]
pub struct SessionRegistry {
    by_handshake_hash: Mutex<BoundedMap<String, Arc<VauSession>>>,
    by_key_id: Mutex<BoundedMap<String, Arc<VauSession>>>,
}

impl SessionRegistry {
    /// Creates a registry whose indexes hold at most `capacity` sessions each.
    pub fn new(capacity: usize) -> Self {
        Self {
            by_handshake_hash: Mutex::new(BoundedMap::new(capacity)),
            by_key_id: Mutex::new(BoundedMap::new(capacity)),
        }
    }

    /// Opens a session for a handshake hash.
    pub fn open(&self, handshake_hash: &str) -> Arc<VauSession> {
        let session = Arc::new(VauSession {
            id: handshake_hash.to_string(),
            key_id: None,
            stage: HandshakeStage::M1,
        });
        if let Some((evicted, _)) = self
            .by_handshake_hash
            .lock()
            .insert(handshake_hash.to_string(), session.clone())
        {
            tracing::debug!("Evicted pending session {}", evicted);
        }
        session
    }

    /// Looks up a session by the hash of its opening handshake message.
    pub fn find_by_handshake_hash(&self, handshake_hash: &str) -> Option<Arc<VauSession>> {
        self.by_handshake_hash.lock().get(&handshake_hash.to_string()).cloned()
    }

    /// Indexes a session under a key id and records the new stage.
    pub fn bind_key_id(
        &self,
        session: &VauSession,
        key_id: &str,
        stage: HandshakeStage,
    ) -> Arc<VauSession> {
        let bound = Arc::new(VauSession {
            id: session.id.clone(),
            key_id: Some(key_id.to_string()),
            stage,
        });
        self.by_handshake_hash
            .lock()
            .insert(session.id.clone(), bound.clone());
        if let Some((evicted, _)) = self.by_key_id.lock().insert(key_id.to_string(), bound.clone()) {
            tracing::debug!("Evicted session for key id {}", evicted);
        }
        bound
    }

    /// Looks up a session by key id.
    pub fn find_by_key_id(&self, key_id: &str) -> Option<Arc<VauSession>> {
        self.by_key_id.lock().get(&key_id.to_string()).cloned()
    }

    /// Number of sessions indexed by key id.
    pub fn bound_sessions(&self) -> usize {
        self.by_key_id.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_map_evicts_oldest() {
        let mut map = BoundedMap::new(2);
        assert!(map.insert("a", 1).is_none());
        assert!(map.insert("b", 2).is_none());
        assert_eq!(map.insert("c", 3), Some(("a", 1)));
        assert!(map.get(&"a").is_none());
        assert_eq!(map.get(&"c"), Some(&3));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn bounded_map_replace_keeps_position() {
        let mut map = BoundedMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert!(map.insert("a", 10).is_none());
        assert_eq!(map.insert("c", 3), Some(("a", 10)));
    }

    #[test]
    fn session_lifecycle() {
        let registry = SessionRegistry::new(16);
        let opened = registry.open("abc");
        assert_eq!(opened.stage, HandshakeStage::M1);

        let found = registry.find_by_handshake_hash("abc").unwrap();
        let bound = registry.bind_key_id(&found, "k1", HandshakeStage::M2);
        assert_eq!(bound.key_id.as_deref(), Some("k1"));

        let by_key = registry.find_by_key_id("k1").unwrap();
        assert_eq!(by_key.id, "abc");
        assert_eq!(
            registry.find_by_handshake_hash("abc").unwrap().stage,
            HandshakeStage::M2
        );
        assert_eq!(registry.bound_sessions(), 1);
    }

    #[test]
    fn registry_is_bounded() {
        let registry = SessionRegistry::new(1);
        registry.open("first");
        registry.open("second");
        assert!(registry.find_by_handshake_hash("first").is_none());
        assert!(registry.find_by_handshake_hash("second").is_some());
    }
}
