use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::PeerId;

/// Writable end of a connection: the outbound queue drained by that
/// connection's writer task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    connection_id: Uuid,
    sender: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn new(connection_id: Uuid, sender: mpsc::Sender<Message>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Create a handle for a fresh connection along with the receiving end
    /// of its outbound queue.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self::new(Uuid::new_v4(), tx), rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn sender(&self) -> &mpsc::Sender<Message> {
        &self.sender
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Who is online: the single mapping from peer identifier to live handle.
///
/// Cloning is cheap and every clone observes the same map. Each operation
/// locks only the shard holding the identifier, so concurrent sessions never
/// see a torn entry. Every mutation republishes `signal_relay_peers_online`.
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<DashMap<PeerId, PeerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `handle`, returning the handle it displaced when that
    /// handle belonged to a different connection. The displaced connection is
    /// left open; closing it is up to the caller.
    pub fn register(&self, id: &str, handle: PeerHandle) -> Option<PeerHandle> {
        let displaced = match self.peers.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(handle);
                if previous.connection_id == entry.get().connection_id {
                    None
                } else {
                    Some(previous)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
        };
        self.publish_online();
        displaced
    }

    pub fn lookup(&self, id: &str) -> Option<PeerHandle> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Remove `id` unconditionally. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> Option<PeerHandle> {
        let removed = self.peers.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            self.publish_online();
        }
        removed
    }

    /// Remove `id` only while it is still bound to `connection_id`.
    pub fn remove_if_current(&self, id: &str, connection_id: Uuid) -> bool {
        let removed = self
            .peers
            .remove_if(id, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if removed {
            self.publish_online();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn publish_online(&self) {
        gauge!("signal_relay_peers_online", self.peers.len() as f64);
    }

    /// Sorted identifiers currently online.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn lookup_returns_latest_registration() {
        let registry = Registry::new();
        let (first, _rx1) = PeerHandle::channel(1);
        let (second, _rx2) = PeerHandle::channel(1);

        assert!(registry.register("alice", first.clone()).is_none());
        let displaced = registry
            .register("alice", second.clone())
            .expect("second connection displaces the first");

        assert_eq!(displaced.connection_id(), first.connection_id());
        assert_eq!(
            registry.lookup("alice").map(|h| h.connection_id()),
            Some(second.connection_id())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn re_registering_same_connection_is_not_a_takeover() {
        let registry = Registry::new();
        let (handle, _rx) = PeerHandle::channel(1);

        registry.register("alice", handle.clone());
        assert!(registry.register("alice", handle).is_none());
    }

    #[test_timeout::timeout]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let (handle, _rx) = PeerHandle::channel(1);
        registry.register("alice", handle);

        assert!(registry.remove("alice").is_some());
        assert!(registry.remove("alice").is_none());
        assert!(registry.lookup("alice").is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn superseded_connection_cannot_remove_successor() {
        let registry = Registry::new();
        let (old, _rx1) = PeerHandle::channel(1);
        let (new, _rx2) = PeerHandle::channel(1);
        registry.register("alice", old.clone());
        registry.register("alice", new.clone());

        assert!(!registry.remove_if_current("alice", old.connection_id()));
        assert!(registry.lookup("alice").is_some());
        assert!(registry.remove_if_current("alice", new.connection_id()));
        assert!(registry.lookup("alice").is_none());
    }

    #[test_timeout::timeout]
    fn concurrent_registration_keeps_one_entry_per_id() {
        let registry = Registry::new();
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for round in 0..200 {
                        let id = format!("peer-{}", round % 4);
                        let (handle, _rx) = PeerHandle::channel(1);
                        let connection_id = handle.connection_id();
                        registry.register(&id, handle);
                        let _ = registry.lookup(&id);
                        if (round + worker) % 3 == 0 {
                            registry.remove_if_current(&id, connection_id);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }

        assert!(registry.len() <= 4);
        let peers = registry.peers();
        let mut deduped = peers.clone();
        deduped.dedup();
        assert_eq!(peers, deduped);
    }
}
