//! Sync exchange: pending request tracking and the store of recent public packets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::identity::PeerId;
use crate::packet::{Packet, PacketId};
use crate::protocol::MessageType;

pub const DEFAULT_SYNC_WINDOW: Duration = Duration::from_secs(30);

/// Outstanding sync requests per peer. A response is accepted only from a peer we asked,
/// and only within the window.
pub struct SyncTracker {
    pending: Mutex<HashMap<PeerId, Instant>>,
    window: Duration,
}

impl SyncTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub fn register_request(&self, peer: PeerId) {
        self.register_request_at(peer, Instant::now());
    }

    pub fn register_request_at(&self, peer: PeerId, now: Instant) {
        self.pending.lock().insert(peer, now);
    }

    pub fn is_valid_response(&self, peer: PeerId) -> bool {
        self.is_valid_response_at(peer, Instant::now())
    }

    /// Expired entries stay until [`SyncTracker::cleanup`] drops them.
    pub fn is_valid_response_at(&self, peer: PeerId, now: Instant) -> bool {
        match self.pending.lock().get(&peer) {
            Some(sent) if now.saturating_duration_since(*sent) <= self.window => true,
            Some(_) => {
                debug!(peer = %peer, "sync response after window");
                false
            }
            None => false,
        }
    }

    /// Remove expired requests; returns the peers that never answered.
    pub fn cleanup(&self) -> Vec<PeerId> {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> Vec<PeerId> {
        let mut expired = Vec::new();
        self.pending.lock().retain(|peer, sent| {
            let live = now.saturating_duration_since(*sent) <= self.window;
            if !live {
                expired.push(*peer);
            }
            live
        });
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_WINDOW)
    }
}

struct StoreInner {
    order: VecDeque<PacketId>,
    packets: HashMap<PacketId, Packet>,
    latest_announce: HashMap<PeerId, PacketId>,
}

/// Bounded store of gossiped packets (announces and public messages) served to sync
/// requests. Only the newest announce per sender is kept.
pub struct GossipStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl GossipStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                order: VecDeque::new(),
                packets: HashMap::new(),
                latest_announce: HashMap::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Returns false for non-gossip packets, duplicates and superseded announces.
    pub fn store(&self, packet: &Packet) -> bool {
        if !packet.message_type.is_gossiped() || !packet.is_broadcast() {
            return false;
        }
        let id = packet.packet_id();
        let mut inner = self.inner.lock();
        if inner.packets.contains_key(&id) {
            return false;
        }
        if packet.message_type == MessageType::Announce {
            if let Some(prev) = inner.latest_announce.get(&packet.sender_id).copied() {
                let newer = inner
                    .packets
                    .get(&prev)
                    .map_or(true, |p| packet.timestamp >= p.timestamp);
                if !newer {
                    return false;
                }
                inner.packets.remove(&prev);
                inner.order.retain(|x| *x != prev);
            }
            inner.latest_announce.insert(packet.sender_id, id);
        }

        let mut stored = packet.clone();
        stored.is_sync_response = false;
        inner.packets.insert(id, stored);
        inner.order.push_back(id);
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                if let Some(p) = inner.packets.remove(&old) {
                    if inner.latest_announce.get(&p.sender_id) == Some(&old) {
                        inner.latest_announce.remove(&p.sender_id);
                    }
                }
            }
        }
        true
    }

    pub fn ids(&self) -> Vec<PacketId> {
        self.inner.lock().order.iter().copied().collect()
    }

    /// Packets the requester lacks, oldest first.
    pub fn missing_for(&self, have: &HashSet<PacketId>) -> Vec<Packet> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter(|id| !have.contains(id))
            .filter_map(|id| inner.packets.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Request-sync payload: concatenated 16-byte packet ids the requester already holds.
pub fn encode_sync_request(ids: &[PacketId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.0).collect()
}

/// Trailing bytes that don't form a whole id are ignored.
pub fn decode_sync_request(payload: &[u8]) -> HashSet<PacketId> {
    payload
        .chunks_exact(16)
        .map(|c| {
            let mut id = [0u8; 16];
            id.copy_from_slice(c);
            PacketId(id)
        })
        .collect()
}
