//! Peer directory: known peers, their keys and nicknames, with change notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::identity::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub nickname: String,
    pub noise_public_key: Option<[u8; 32]>,
    pub signing_public_key: Option<[u8; 32]>,
    /// Fingerprint checked out of band.
    pub is_verified: bool,
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(peer_id: PeerId, nickname: String) -> Self {
        Self {
            peer_id,
            nickname,
            noise_public_key: None,
            signing_public_key: None,
            is_verified: false,
            last_seen: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Added(PeerRecord),
    Updated(PeerRecord),
    Removed(PeerId),
}

pub type PeerObserver = Arc<dyn Fn(&PeerChange) + Send + Sync>;

/// Thread-safe peer table. Observers run after the lock is released, once per call that
/// changed a nickname, key or verification flag. `last_seen` refreshes never notify.
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    observers: RwLock<Vec<PeerObserver>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: PeerObserver) {
        self.observers.write().push(observer);
    }

    fn notify(&self, change: PeerChange) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(&change);
        }
    }

    /// Insert a peer or refresh it. Returns true if a notification fired.
    pub fn add_or_update_peer(&self, peer_id: PeerId, nickname: &str) -> bool {
        let change = {
            let mut peers = self.peers.write();
            match peers.get_mut(&peer_id) {
                Some(record) => {
                    record.last_seen = Instant::now();
                    if record.nickname == nickname {
                        None
                    } else {
                        record.nickname = nickname.to_string();
                        Some(PeerChange::Updated(record.clone()))
                    }
                }
                None => {
                    let record = PeerRecord::new(peer_id, nickname.to_string());
                    peers.insert(peer_id, record.clone());
                    Some(PeerChange::Added(record))
                }
            }
        };
        self.fire(change)
    }

    /// Set every identity field at once. Returns true if a notification fired.
    pub fn update_peer_info(
        &self,
        peer_id: PeerId,
        nickname: &str,
        noise_public_key: Option<[u8; 32]>,
        signing_public_key: Option<[u8; 32]>,
        is_verified: bool,
    ) -> bool {
        let change = {
            let mut peers = self.peers.write();
            let existed = peers.contains_key(&peer_id);
            let record = peers
                .entry(peer_id)
                .or_insert_with(|| PeerRecord::new(peer_id, String::new()));
            record.last_seen = Instant::now();
            let changed = !existed
                || record.nickname != nickname
                || record.noise_public_key != noise_public_key
                || record.signing_public_key != signing_public_key
                || record.is_verified != is_verified;
            if changed {
                record.nickname = nickname.to_string();
                record.noise_public_key = noise_public_key;
                record.signing_public_key = signing_public_key;
                record.is_verified = is_verified;
                let snapshot = record.clone();
                Some(if existed {
                    PeerChange::Updated(snapshot)
                } else {
                    PeerChange::Added(snapshot)
                })
            } else {
                None
            }
        };
        self.fire(change)
    }

    pub fn set_verified(&self, peer_id: PeerId, verified: bool) -> bool {
        let change = {
            let mut peers = self.peers.write();
            match peers.get_mut(&peer_id) {
                Some(record) if record.is_verified != verified => {
                    record.is_verified = verified;
                    Some(PeerChange::Updated(record.clone()))
                }
                _ => None,
            }
        };
        self.fire(change)
    }

    pub fn remove_peer(&self, peer_id: PeerId) -> bool {
        let removed = self.peers.write().remove(&peer_id).is_some();
        self.fire(removed.then_some(PeerChange::Removed(peer_id)))
    }

    fn fire(&self, change: Option<PeerChange>) -> bool {
        match change {
            Some(change) => {
                self.notify(change);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.peers.read().get(&peer_id).cloned()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.read().contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    pub fn nicknames(&self) -> HashMap<PeerId, String> {
        self.peers
            .read()
            .iter()
            .map(|(id, r)| (*id, r.nickname.clone()))
            .collect()
    }

    /// Peers not seen within `max_age`.
    pub fn stale_peers(&self, max_age: std::time::Duration) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|r| r.last_seen.elapsed() > max_age)
            .map(|r| r.peer_id)
            .collect()
    }
}
