//! Per-peer attribute cache.
//!
//! A [`Peerstore`] keeps a key → value map per peer ID: the connect config
//! snapshot used for reconnection, the negotiated session key and whatever
//! session values handlers store through their context. Two backings are
//! provided and interchangeable: [`MemoryPeerstore`] and
//! [`SessionPeerstore`] over any [`SessionStore`].

use dashmap::DashMap;
use owtp_types::ConnectConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Reserved key: serialized [`PeerInfo`].
pub const PEER_INFO_KEY: &str = "owtp.connect_config";
/// Reserved key: negotiated [`crate::auth::SessionKey`].
pub const SESSION_KEY: &str = "owtp.session_key";

/// Identity and config snapshot of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub pid: String,
    /// Whether the local node dialed this peer.
    pub is_host: bool,
    pub config: ConnectConfig,
}

/// Concurrent per-peer attribute store.
pub trait Peerstore: Send + Sync + 'static {
    fn get(&self, pid: &str, key: &str) -> Option<Value>;
    fn put(&self, pid: &str, key: &str, value: Value);
    fn delete(&self, pid: &str, key: &str);
    /// Drop every attribute of a peer.
    fn destroy(&self, pid: &str);

    /// Snapshot the peer's config for later reconnection.
    fn save_peer(&self, info: &PeerInfo) {
        match serde_json::to_value(info) {
            Ok(value) => self.put(&info.pid, PEER_INFO_KEY, value),
            Err(e) => warn!(pid = %info.pid, error = %e, "OWTP: failed to snapshot peer"),
        }
    }

    fn peer_info(&self, pid: &str) -> Option<PeerInfo> {
        self.get(pid, PEER_INFO_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

/// In-memory peerstore.
#[derive(Debug, Default)]
pub struct MemoryPeerstore {
    peers: DashMap<String, HashMap<String, Value>>,
}

impl MemoryPeerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers with at least one attribute.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Peerstore for MemoryPeerstore {
    fn get(&self, pid: &str, key: &str) -> Option<Value> {
        self.peers.get(pid).and_then(|attrs| attrs.get(key).cloned())
    }

    fn put(&self, pid: &str, key: &str, value: Value) {
        self.peers
            .entry(pid.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn delete(&self, pid: &str, key: &str) {
        if let Some(mut attrs) = self.peers.get_mut(pid) {
            attrs.remove(key);
        }
    }

    fn destroy(&self, pid: &str) {
        self.peers.remove(pid);
    }
}

/// Whole-record session storage, e.g. a shared cache in front of several
/// nodes.
pub trait SessionStore: Send + Sync + 'static {
    fn load(&self, session_id: &str) -> Option<HashMap<String, Value>>;
    fn save(&self, session_id: &str, values: HashMap<String, Value>);
    fn remove(&self, session_id: &str);
}

/// In-process [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, HashMap<String, Value>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: &str) -> Option<HashMap<String, Value>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    fn save(&self, session_id: &str, values: HashMap<String, Value>) {
        self.sessions.insert(session_id.to_string(), values);
    }

    fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

/// Peerstore backed by a [`SessionStore`]; the peer ID is the session ID.
///
/// Read-modify-write cycles are serialized per peer so concurrent writers
/// on one node never lose updates.
pub struct SessionPeerstore<S: SessionStore> {
    store: S,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: SessionStore> SessionPeerstore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn modify(&self, pid: &str, f: impl FnOnce(&mut HashMap<String, Value>)) {
        let lock = Arc::clone(self.locks.entry(pid.to_string()).or_default().value());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.store.load(pid).unwrap_or_default();
        f(&mut values);
        self.store.save(pid, values);
    }
}

impl<S: SessionStore> Peerstore for SessionPeerstore<S> {
    fn get(&self, pid: &str, key: &str) -> Option<Value> {
        self.store.load(pid).and_then(|mut v| v.remove(key))
    }

    fn put(&self, pid: &str, key: &str, value: Value) {
        self.modify(pid, |values| {
            values.insert(key.to_string(), value);
        });
    }

    fn delete(&self, pid: &str, key: &str) {
        self.modify(pid, |values| {
            values.remove(key);
        });
    }

    fn destroy(&self, pid: &str) {
        self.store.remove(pid);
        self.locks.remove(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owtp_types::ConnectType;
    use serde_json::json;

    fn exercise(store: &dyn Peerstore) {
        assert!(store.get("p1", "k").is_none());
        store.put("p1", "k", json!("v"));
        store.put("p1", "n", json!(3));
        assert_eq!(store.get("p1", "k"), Some(json!("v")));
        assert!(store.get("p2", "k").is_none());

        store.delete("p1", "k");
        assert!(store.get("p1", "k").is_none());
        assert_eq!(store.get("p1", "n"), Some(json!(3)));

        store.destroy("p1");
        assert!(store.get("p1", "n").is_none());
    }

    fn exercise_peer_info(store: &dyn Peerstore) {
        let info = PeerInfo {
            pid: "p9".to_string(),
            is_host: true,
            config: ConnectConfig::new(ConnectType::Http, "127.0.0.1:8422"),
        };
        store.save_peer(&info);
        assert_eq!(store.peer_info("p9"), Some(info));
        assert!(store.peer_info("missing").is_none());
    }

    #[test]
    fn test_memory_peerstore() {
        let store = MemoryPeerstore::new();
        exercise(&store);
        exercise_peer_info(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_session_peerstore() {
        let store = SessionPeerstore::new(MemorySessionStore::new());
        exercise(&store);
        exercise_peer_info(&store);
    }

    #[test]
    fn test_session_peerstore_concurrent_writers() {
        let store = Arc::new(SessionPeerstore::new(MemorySessionStore::new()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.put("shared", &format!("k{i}-{j}"), json!(j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let record = store.store().load("shared").unwrap();
        assert_eq!(record.len(), 400);
    }
}
