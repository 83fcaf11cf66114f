//! Host-driven API: MeshCore receives link events and packets from the host, returns actions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::announce::{AnnounceError, Announcement, MAX_ANNOUNCED_NEIGHBORS};
use crate::config::Config;
use crate::fragment::{split_into_fragments, FragmentError, FragmentReassembler, FragmentResult};
use crate::identity::{self, Identity, IdentityError, IdentityStore, PeerId};
use crate::noise::{SessionError, SessionManager, SessionPhase};
use crate::packet::{Packet, PacketId};
use crate::peers::PeerDirectory;
use crate::protocol::{MessageType, NoisePayloadType, PROTOCOL_VERSION_2};
use crate::relay::{DedupCache, EnvelopeError, RelayEnvelope};
use crate::sync::{self, GossipStore, SyncTracker};
use crate::token::find_payment_token;
use crate::topology::{MeshTopology, TopologySnapshot};
use crate::wire::{self, DecodeError, EncodeError};

/// Length of the message id carried in private messages, acks and read receipts.
pub const MESSAGE_ID_LEN: usize = 16;

pub type MessageId = [u8; MESSAGE_ID_LEN];

/// Main coordinator. The host owns the links; the core decides what goes over them.
pub struct MeshCore {
    identity: Identity,
    local_peer: PeerId,
    nickname: RwLock<String>,
    config: Config,
    sessions: SessionManager,
    peers: PeerDirectory,
    topology: MeshTopology,
    sync: SyncTracker,
    gossip: GossipStore,
    seen_packets: DedupCache<PacketId>,
    seen_relay_events: DedupCache<String>,
    fragments: Mutex<FragmentReassembler>,
    /// Peers with a live link to this node.
    links: RwLock<HashSet<PeerId>>,
    /// Noise plaintexts waiting for a session with their recipient.
    pending: Mutex<HashMap<PeerId, Vec<Vec<u8>>>>,
    /// Timed-out handshakes per peer since its last established session.
    handshake_timeouts: Mutex<HashMap<PeerId, u32>>,
    tick_count: AtomicU64,
}

impl MeshCore {
    pub fn new(identity: Identity, nickname: &str, config: Config) -> Self {
        let config = config.normalized();
        let local_peer = identity.peer_id();
        Self {
            sessions: SessionManager::with_failure_threshold(
                identity.noise().clone(),
                config.decrypt_failure_threshold,
            ),
            identity,
            local_peer,
            nickname: RwLock::new(nickname.to_string()),
            peers: PeerDirectory::new(),
            topology: MeshTopology::new(),
            sync: SyncTracker::new(config.sync_window()),
            gossip: GossipStore::new(config.gossip_capacity),
            seen_packets: DedupCache::new(config.packet_dedup_capacity),
            seen_relay_events: DedupCache::new(config.relay_dedup_capacity),
            fragments: Mutex::new(FragmentReassembler::new(
                config.fragment_timeout(),
                config.max_fragment_sets,
            )),
            links: RwLock::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            handshake_timeouts: Mutex::new(HashMap::new()),
            tick_count: AtomicU64::new(0),
            config,
        }
    }

    /// Load (or create and persist) the identity from `store`.
    pub fn with_store(
        store: &dyn IdentityStore,
        nickname: &str,
        config: Config,
    ) -> Result<Self, IdentityError> {
        Ok(Self::new(Identity::load_or_create(store)?, nickname, config))
    }

    pub fn peer_id(&self) -> PeerId {
        self.local_peer
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn nickname(&self) -> String {
        self.nickname.read().clone()
    }

    pub fn set_nickname(&self, nickname: &str) {
        *self.nickname.write() = nickname.to_string();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn topology(&self) -> &MeshTopology {
        &self.topology
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        self.topology.snapshot(&self.peers.nicknames())
    }

    pub fn links(&self) -> Vec<PeerId> {
        let mut links: Vec<PeerId> = self.links.read().iter().copied().collect();
        links.sort();
        links
    }

    fn is_link(&self, peer: PeerId) -> bool {
        self.links.read().contains(&peer)
    }

    // ---- link events ----

    /// A transport link to `peer` came up. Announces ourselves and asks the peer for
    /// gossip we missed.
    pub fn on_link_established(&self, peer: PeerId) -> Vec<Action> {
        if peer == self.local_peer || peer.is_broadcast() {
            return Vec::new();
        }
        let added = self.links.write().insert(peer);
        if added {
            info!(peer = %peer, "link established");
        }
        let mut actions = logged(self.announce(), "announce");
        actions.extend(logged(self.request_sync(peer), "sync request"));
        actions
    }

    /// A transport link to `peer` went away. The session with it is dropped along with
    /// queued messages; the updated neighbour set is announced.
    pub fn on_link_lost(&self, peer: PeerId) -> Vec<Action> {
        if !self.links.write().remove(&peer) {
            return Vec::new();
        }
        info!(peer = %peer, "link lost");
        self.forget_session(peer);
        logged(self.announce(), "announce")
    }

    // ---- inbound ----

    /// Handle one frame received over the link to `from_link`.
    ///
    /// Only undecodable frames are reported as errors; every other rejection (bad
    /// signature, failed decryption, unsolicited sync response) is logged and yields no
    /// actions.
    pub fn on_packet_received(
        &self,
        from_link: PeerId,
        bytes: &[u8],
    ) -> Result<Vec<Action>, MessageError> {
        let packet = wire::decode(bytes).map_err(|e| {
            debug!(link = %from_link, error = %e, "dropping undecodable frame");
            e
        })?;
        Ok(self.process(packet, from_link, true))
    }

    fn process(&self, packet: Packet, from_link: PeerId, forward: bool) -> Vec<Action> {
        if packet.sender_id == self.local_peer {
            return Vec::new();
        }
        if packet.is_sync_response && !self.sync.is_valid_response(from_link) {
            debug!(link = %from_link, "dropping unsolicited sync response");
            return Vec::new();
        }
        if self.seen_packets.is_duplicate(packet.packet_id()) {
            return Vec::new();
        }

        let addressed_to_us = packet.is_addressed_to(self.local_peer);
        let mut actions = Vec::new();
        if forward && !addressed_to_us && !packet.is_sync_response {
            actions.extend(self.forward(&packet, from_link));
        }
        if addressed_to_us || packet.is_broadcast() {
            actions.extend(self.handle_local(packet, from_link));
        }
        actions
    }

    fn forward(&self, packet: &Packet, from_link: PeerId) -> Vec<Action> {
        let Some(next) = packet.relayed() else {
            return Vec::new();
        };
        let bytes = match wire::encode(&next) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "re-encoding relayed packet failed");
                return Vec::new();
            }
        };
        match self.next_hop(&next) {
            Some(to) => vec![Action::Send { to, bytes }],
            None => vec![Action::Broadcast {
                bytes,
                exclude: Some(from_link),
            }],
        }
    }

    /// Direct link to hand `packet` to, when the route or recipient names one.
    fn next_hop(&self, packet: &Packet) -> Option<PeerId> {
        if let Some(route) = &packet.route {
            let next = match route.iter().position(|hop| *hop == self.local_peer) {
                Some(pos) => route.get(pos + 1).copied().or(packet.recipient_id),
                None if packet.sender_id == self.local_peer => route.first().copied(),
                None => None,
            };
            if let Some(next) = next.filter(|p| self.is_link(*p)) {
                return Some(next);
            }
        }
        packet
            .recipient_id
            .filter(|r| !r.is_broadcast() && self.is_link(*r))
    }

    fn handle_local(&self, packet: Packet, from_link: PeerId) -> Vec<Action> {
        match packet.message_type {
            MessageType::Announce => self.handle_announce(&packet),
            MessageType::Message => self.handle_public_message(&packet),
            MessageType::Leave => self.handle_leave(&packet),
            MessageType::NoiseHandshake => self.handle_handshake(&packet),
            MessageType::NoiseEncrypted => self.handle_encrypted(&packet),
            MessageType::Fragment => self.handle_fragment(&packet, from_link),
            MessageType::RequestSync => self.handle_sync_request(&packet, from_link),
            MessageType::RelayBridge => self.handle_relay_bridge(&packet),
        }
    }

    fn handle_announce(&self, packet: &Packet) -> Vec<Action> {
        let announcement = match Announcement::decode(&packet.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!(sender = %packet.sender_id, error = %e, "malformed announce");
                return Vec::new();
            }
        };
        if PeerId::from_public_key(&announcement.noise_public_key) != packet.sender_id {
            warn!(sender = %packet.sender_id, "announce key does not match sender id");
            return Vec::new();
        }
        if !packet.verify_signature(&announcement.signing_public_key) {
            warn!(sender = %packet.sender_id, "announce signature invalid");
            return Vec::new();
        }

        let sender = packet.sender_id;
        if !self.topology.update_from_announcement(
            sender,
            Some(&announcement.nickname),
            announcement.neighbors.as_deref(),
            packet.timestamp,
        ) {
            debug!(sender = %sender, "stale announce ignored");
            return Vec::new();
        }
        let previous = self.peers.get(sender);
        let keeps_verification = previous.as_ref().is_some_and(|p| {
            p.is_verified && p.noise_public_key == Some(announcement.noise_public_key)
        });
        self.peers.update_peer_info(
            sender,
            &announcement.nickname,
            Some(announcement.noise_public_key),
            Some(announcement.signing_public_key),
            keeps_verification,
        );
        self.gossip.store(packet);

        let renamed = previous
            .as_ref()
            .map_or(true, |p| p.nickname != announcement.nickname);
        if previous.is_none() {
            info!(peer = %sender, nickname = %announcement.nickname, "peer joined");
        }
        if renamed {
            vec![Action::Deliver(Delivery::PeerAnnounced {
                peer: sender,
                nickname: announcement.nickname,
            })]
        } else {
            Vec::new()
        }
    }

    /// Packets from peers whose signing key we know must carry a valid signature.
    fn signature_acceptable(&self, packet: &Packet) -> bool {
        match self
            .peers
            .get(packet.sender_id)
            .and_then(|p| p.signing_public_key)
        {
            Some(key) => packet.verify_signature(&key),
            None => true,
        }
    }

    fn handle_public_message(&self, packet: &Packet) -> Vec<Action> {
        if !self.signature_acceptable(packet) {
            warn!(sender = %packet.sender_id, "public message signature invalid");
            return Vec::new();
        }
        let Ok(text) = String::from_utf8(packet.payload.clone()) else {
            debug!(sender = %packet.sender_id, "public message is not UTF-8");
            return Vec::new();
        };
        self.gossip.store(packet);
        let payment_token = find_payment_token(&text).map(str::to_string);
        vec![Action::Deliver(Delivery::PublicMessage {
            from: packet.sender_id,
            nickname: self.peers.get(packet.sender_id).map(|p| p.nickname),
            text,
            timestamp: packet.timestamp,
            payment_token,
        })]
    }

    fn handle_leave(&self, packet: &Packet) -> Vec<Action> {
        if !self.signature_acceptable(packet) {
            warn!(sender = %packet.sender_id, "leave signature invalid");
            return Vec::new();
        }
        let peer = packet.sender_id;
        let known = self.peers.remove_peer(peer);
        self.topology.remove_peer(peer, packet.timestamp);
        self.forget_session(peer);
        if !known {
            return Vec::new();
        }
        info!(peer = %peer, "peer left");
        vec![Action::Deliver(Delivery::PeerLeft { peer })]
    }

    fn handle_handshake(&self, packet: &Packet) -> Vec<Action> {
        let peer = packet.sender_id;
        let outcome = match self.sessions.handle_handshake(peer, &packet.payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(peer = %peer, error = %e, "noise handshake failed");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        if let Some(reply) = outcome.reply {
            let reply = self.addressed_packet(MessageType::NoiseHandshake, peer, reply);
            actions.extend(logged(self.dispatch(&reply), "handshake reply"));
        }
        if let Some(remote_static) = outcome.established {
            self.handshake_timeouts.lock().remove(&peer);
            actions.push(Action::Deliver(Delivery::SessionEstablished {
                peer,
                fingerprint: identity::fingerprint(&remote_static),
            }));
            actions.extend(self.flush_pending(peer));
        }
        actions
    }

    fn flush_pending(&self, peer: PeerId) -> Vec<Action> {
        let queued = self.pending.lock().remove(&peer).unwrap_or_default();
        let mut actions = Vec::new();
        for plaintext in queued {
            actions.extend(logged(self.send_encrypted(peer, &plaintext), "queued message"));
        }
        actions
    }

    fn handle_encrypted(&self, packet: &Packet) -> Vec<Action> {
        let peer = packet.sender_id;
        let plaintext = match self.sessions.decrypt(peer, &packet.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping undecryptable packet");
                return Vec::new();
            }
        };
        let Some((&kind, body)) = plaintext.split_first() else {
            return Vec::new();
        };
        let Some(kind) = NoisePayloadType::from_byte(kind) else {
            debug!(peer = %peer, kind, "unknown noise payload type");
            return Vec::new();
        };

        match kind {
            NoisePayloadType::PrivateMessage => {
                let Some((message_id, text)) = split_message_id(body) else {
                    return Vec::new();
                };
                let Ok(text) = String::from_utf8(text.to_vec()) else {
                    debug!(peer = %peer, "private message is not UTF-8");
                    return Vec::new();
                };
                let payment_token = find_payment_token(&text).map(str::to_string);
                let mut actions = vec![Action::Deliver(Delivery::PrivateMessage {
                    from: peer,
                    message_id,
                    text,
                    timestamp: packet.timestamp,
                    payment_token,
                })];
                let ack = noise_payload(NoisePayloadType::Delivered, &message_id, &[]);
                actions.extend(logged(self.send_noise_payload(peer, ack), "delivery ack"));
                actions
            }
            NoisePayloadType::Delivered => split_message_id(body)
                .map(|(message_id, _)| {
                    vec![Action::Deliver(Delivery::DeliveryAck {
                        from: peer,
                        message_id,
                    })]
                })
                .unwrap_or_default(),
            NoisePayloadType::ReadReceipt => split_message_id(body)
                .map(|(message_id, _)| {
                    vec![Action::Deliver(Delivery::ReadReceipt {
                        from: peer,
                        message_id,
                    })]
                })
                .unwrap_or_default(),
            other => {
                debug!(peer = %peer, kind = ?other, "ignoring noise payload");
                Vec::new()
            }
        }
    }

    fn handle_fragment(&self, packet: &Packet, from_link: PeerId) -> Vec<Action> {
        let result = self
            .fragments
            .lock()
            .on_fragment(packet.sender_id, &packet.payload);
        match result {
            Ok(FragmentResult::Complete { bytes, .. }) => match wire::decode(&bytes) {
                // The fragments themselves were already forwarded.
                Ok(original) => self.process(original, from_link, false),
                Err(e) => {
                    debug!(sender = %packet.sender_id, error = %e, "reassembled packet undecodable");
                    Vec::new()
                }
            },
            Ok(FragmentResult::InProgress) => Vec::new(),
            Err(e) => {
                debug!(sender = %packet.sender_id, error = %e, "bad fragment");
                Vec::new()
            }
        }
    }

    fn handle_sync_request(&self, packet: &Packet, from_link: PeerId) -> Vec<Action> {
        let have = sync::decode_sync_request(&packet.payload);
        let missing = self.gossip.missing_for(&have);
        if !missing.is_empty() {
            debug!(link = %from_link, count = missing.len(), "answering sync request");
        }
        let mut actions = Vec::new();
        for stored in missing {
            let response = Packet {
                ttl: 0,
                is_sync_response: true,
                ..stored
            };
            match self.encode_frames(&response) {
                Ok(frames) => actions.extend(frames.into_iter().map(|bytes| Action::Send {
                    to: from_link,
                    bytes,
                })),
                Err(e) => warn!(error = %e, "encoding sync response failed"),
            }
        }
        actions
    }

    fn handle_relay_bridge(&self, packet: &Packet) -> Vec<Action> {
        let envelope = match RelayEnvelope::decode(&packet.payload) {
            Ok(e) => e,
            Err(e) => {
                debug!(sender = %packet.sender_id, error = %e, "bad relay envelope");
                return Vec::new();
            }
        };
        let event = envelope.event();
        if !event.verify_id() || !event.verify_signature() {
            debug!(sender = %packet.sender_id, id = %event.id, "relay event failed verification");
            return Vec::new();
        }
        if self.seen_relay_events.is_duplicate(event.id.clone()) {
            return Vec::new();
        }
        vec![Action::Deliver(Delivery::RelayEvent {
            from: packet.sender_id,
            envelope,
        })]
    }

    // ---- outbound ----

    fn base_packet(&self, message_type: MessageType, payload: Vec<u8>) -> Packet {
        Packet::new(message_type, self.local_peer, payload)
            .with_version(self.config.protocol_version)
            .with_ttl(self.config.default_ttl)
    }

    /// Unicast packet to `to`, source-routed when version 2 is enabled and the topology
    /// knows a path.
    fn addressed_packet(&self, message_type: MessageType, to: PeerId, payload: Vec<u8>) -> Packet {
        let packet = self.base_packet(message_type, payload).with_recipient(to);
        if self.config.protocol_version < PROTOCOL_VERSION_2 || self.is_link(to) {
            return packet;
        }
        match self
            .topology
            .compute_route(self.local_peer, to, self.config.max_route_hops)
        {
            Some(route) if !route.is_empty() => packet.with_route(route),
            _ => packet,
        }
    }

    /// Wire frames for `packet`: one frame, or its fragments when larger than the MTU.
    fn encode_frames(&self, packet: &Packet) -> Result<Vec<Vec<u8>>, MessageError> {
        let unpadded = wire::encode_unpadded(packet)?;
        if unpadded.len() <= self.config.mtu {
            return Ok(vec![wire::encode(packet)?]);
        }
        let fragments = split_into_fragments(packet, &unpadded, self.config.max_fragment_size)?;
        debug!(count = fragments.len(), size = unpadded.len(), "fragmenting packet");
        Ok(fragments
            .iter()
            .map(wire::encode)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Encode and pick links for an outgoing packet.
    fn dispatch(&self, packet: &Packet) -> Result<Vec<Action>, MessageError> {
        let frames = self.encode_frames(packet)?;
        let target = self.next_hop(packet);
        Ok(frames
            .into_iter()
            .map(|bytes| match target {
                Some(to) => Action::Send { to, bytes },
                None => Action::Broadcast {
                    bytes,
                    exclude: None,
                },
            })
            .collect())
    }

    /// Signed announcement of our identity keys, nickname and current links.
    pub fn announce(&self) -> Result<Vec<Action>, MessageError> {
        let nickname = self.nickname();
        let mut neighbors = self.links();
        neighbors.truncate(MAX_ANNOUNCED_NEIGHBORS);
        let announcement = Announcement {
            nickname: nickname.clone(),
            noise_public_key: *self.identity.noise().public_key(),
            signing_public_key: self.identity.signing().public_key(),
            neighbors: Some(neighbors.clone()),
        };
        let packet = self
            .base_packet(MessageType::Announce, announcement.encode()?)
            .sign(self.identity.signing())?;
        self.topology.update_from_announcement(
            self.local_peer,
            Some(&nickname),
            Some(&neighbors),
            packet.timestamp,
        );
        self.gossip.store(&packet);
        self.dispatch(&packet)
    }

    pub fn send_public_message(&self, text: &str) -> Result<Vec<Action>, MessageError> {
        let packet = self
            .base_packet(MessageType::Message, text.as_bytes().to_vec())
            .sign(self.identity.signing())?;
        self.gossip.store(&packet);
        self.dispatch(&packet)
    }

    /// Send `text` to `to` over its Noise session. Without a session the message is queued
    /// and a handshake is started; it goes out once the session is established.
    pub fn send_private_message(
        &self,
        to: PeerId,
        text: &str,
    ) -> Result<(MessageId, Vec<Action>), MessageError> {
        let mut message_id = [0u8; MESSAGE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut message_id);
        let plaintext =
            noise_payload(NoisePayloadType::PrivateMessage, &message_id, text.as_bytes());
        let actions = self.send_noise_payload(to, plaintext)?;
        Ok((message_id, actions))
    }

    pub fn send_read_receipt(
        &self,
        to: PeerId,
        message_id: MessageId,
    ) -> Result<Vec<Action>, MessageError> {
        self.send_noise_payload(to, noise_payload(NoisePayloadType::ReadReceipt, &message_id, &[]))
    }

    fn send_noise_payload(&self, to: PeerId, plaintext: Vec<u8>) -> Result<Vec<Action>, MessageError> {
        if to == self.local_peer || to.is_broadcast() {
            return Err(MessageError::InvalidRecipient);
        }
        match self.sessions.phase(to) {
            SessionPhase::Established => self.send_encrypted(to, &plaintext),
            SessionPhase::Handshaking => {
                self.enqueue(to, plaintext)?;
                Ok(Vec::new())
            }
            SessionPhase::Uninitialized | SessionPhase::Failed => {
                self.enqueue(to, plaintext)?;
                self.start_handshake(to)
            }
        }
    }

    fn enqueue(&self, to: PeerId, plaintext: Vec<u8>) -> Result<(), MessageError> {
        let mut pending = self.pending.lock();
        let queue = pending.entry(to).or_default();
        if queue.len() >= self.config.max_pending_messages {
            return Err(MessageError::QueueFull);
        }
        queue.push(plaintext);
        Ok(())
    }

    fn forget_session(&self, peer: PeerId) {
        self.sessions.remove(peer);
        self.pending.lock().remove(&peer);
        self.handshake_timeouts.lock().remove(&peer);
    }

    fn send_encrypted(&self, to: PeerId, plaintext: &[u8]) -> Result<Vec<Action>, MessageError> {
        let ciphertext = self.sessions.encrypt(to, plaintext)?;
        self.dispatch(&self.addressed_packet(MessageType::NoiseEncrypted, to, ciphertext))
    }

    fn start_handshake(&self, to: PeerId) -> Result<Vec<Action>, MessageError> {
        let first = self.sessions.initiate(to)?;
        self.dispatch(&self.addressed_packet(MessageType::NoiseHandshake, to, first))
    }

    /// Signed leave broadcast. The host should stop ticking after sending it.
    pub fn leave(&self) -> Result<Vec<Action>, MessageError> {
        let packet = self
            .base_packet(MessageType::Leave, Vec::new())
            .sign(self.identity.signing())?;
        self.dispatch(&packet)
    }

    /// Ask the directly linked `peer` for gossip we lack. Responses are accepted from it
    /// for the sync window.
    pub fn request_sync(&self, peer: PeerId) -> Result<Vec<Action>, MessageError> {
        let payload = sync::encode_sync_request(&self.gossip.ids());
        let packet = self
            .base_packet(MessageType::RequestSync, payload)
            .with_ttl(1)
            .with_recipient(peer);
        self.sync.register_request(peer);
        let bytes = wire::encode(&packet)?;
        Ok(vec![Action::Send { to: peer, bytes }])
    }

    /// Flood a relay envelope through the mesh.
    pub fn send_relay_envelope(&self, envelope: &RelayEnvelope) -> Result<Vec<Action>, MessageError> {
        let event = envelope.event();
        if !event.verify_id() || !event.verify_signature() {
            return Err(MessageError::InvalidRelayEvent);
        }
        self.seen_relay_events.is_duplicate(event.id.clone());
        let packet = self.base_packet(MessageType::RelayBridge, envelope.encode()?);
        self.dispatch(&packet)
    }

    // ---- timers ----

    /// Periodic housekeeping. Call about once a second.
    pub fn tick(&self) -> Vec<Action> {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut actions = Vec::new();

        let dropped = self.fragments.lock().cleanup();
        if dropped > 0 {
            debug!(dropped, "expired incomplete fragment sets");
        }
        for peer in self.sync.cleanup() {
            debug!(peer = %peer, "sync window closed");
        }
        for peer in self.sessions.expire_handshakes(self.config.handshake_timeout()) {
            actions.extend(self.handshake_timed_out(peer));
        }
        for peer in self.sessions.peers_needing_rehandshake() {
            warn!(peer = %peer, "repeated decrypt failures, re-handshaking");
            self.sessions.remove(peer);
            actions.extend(logged(self.start_handshake(peer), "re-handshake"));
        }

        let interval = self.config.announce_interval_ticks;
        if interval > 0 && tick % interval == 0 {
            actions.extend(logged(self.announce(), "announce"));
        }
        actions
    }

    /// Retry while messages wait and retries remain; otherwise drop the queue.
    fn handshake_timed_out(&self, peer: PeerId) -> Vec<Action> {
        let attempts = {
            let mut timeouts = self.handshake_timeouts.lock();
            let n = timeouts.entry(peer).or_insert(0);
            *n += 1;
            *n
        };
        let waiting = self.pending.lock().get(&peer).map_or(0, Vec::len);
        if waiting > 0 && attempts <= self.config.handshake_retries {
            debug!(peer = %peer, attempts, "handshake timed out, retrying");
            return logged(self.start_handshake(peer), "handshake retry");
        }
        self.handshake_timeouts.lock().remove(&peer);
        if waiting > 0 {
            self.pending.lock().remove(&peer);
            warn!(peer = %peer, dropped = waiting, "handshake abandoned, queued messages dropped");
        }
        Vec::new()
    }
}

fn logged(result: Result<Vec<Action>, MessageError>, what: &str) -> Vec<Action> {
    result.unwrap_or_else(|e| {
        warn!(error = %e, "{what} failed");
        Vec::new()
    })
}

fn noise_payload(kind: NoisePayloadType, message_id: &MessageId, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + MESSAGE_ID_LEN + body.len());
    out.push(kind.as_byte());
    out.extend_from_slice(message_id);
    out.extend_from_slice(body);
    out
}

fn split_message_id(body: &[u8]) -> Option<(MessageId, &[u8])> {
    if body.len() < MESSAGE_ID_LEN {
        return None;
    }
    let (id, rest) = body.split_at(MESSAGE_ID_LEN);
    let mut message_id = [0u8; MESSAGE_ID_LEN];
    message_id.copy_from_slice(id);
    Some((message_id, rest))
}

/// Something the core wants the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write `bytes` to the link with `to`.
    Send { to: PeerId, bytes: Vec<u8> },
    /// Write `bytes` to every link except `exclude`.
    Broadcast {
        bytes: Vec<u8>,
        exclude: Option<PeerId>,
    },
    /// Surface an event to the application.
    Deliver(Delivery),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    PublicMessage {
        from: PeerId,
        nickname: Option<String>,
        text: String,
        timestamp: u64,
        payment_token: Option<String>,
    },
    PrivateMessage {
        from: PeerId,
        message_id: MessageId,
        text: String,
        timestamp: u64,
        payment_token: Option<String>,
    },
    DeliveryAck {
        from: PeerId,
        message_id: MessageId,
    },
    ReadReceipt {
        from: PeerId,
        message_id: MessageId,
    },
    /// First announce from a peer, or a nickname change.
    PeerAnnounced { peer: PeerId, nickname: String },
    PeerLeft { peer: PeerId },
    SessionEstablished { peer: PeerId, fingerprint: String },
    RelayEvent {
        from: PeerId,
        envelope: RelayEnvelope,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Announce(#[from] AnnounceError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("cannot address a private message to self or broadcast")]
    InvalidRecipient,
    #[error("relay event id or signature does not verify")]
    InvalidRelayEvent,
    #[error("too many messages queued for a peer without a session")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayEvent, RelayKeypair, KIND_GEOHASH_CHAT};
    use rand::Rng;

    fn node(name: &str) -> MeshCore {
        MeshCore::new(Identity::generate(), name, Config::default())
    }

    fn frames(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { bytes, .. } | Action::Broadcast { bytes, .. } => Some(bytes.clone()),
                Action::Deliver(_) => None,
            })
            .collect()
    }

    fn deliveries(actions: &[Action]) -> Vec<Delivery> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Deliver(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Frames `from` addressed at `to`, fed into `to`.
    fn relay(from: &MeshCore, to: &MeshCore, actions: &[Action]) -> Vec<Action> {
        let mut out = Vec::new();
        for action in actions {
            let bytes = match action {
                Action::Send { to: target, bytes } if *target == to.peer_id() => bytes,
                Action::Broadcast { bytes, exclude } if *exclude != Some(to.peer_id()) => bytes,
                _ => continue,
            };
            out.extend(to.on_packet_received(from.peer_id(), bytes).unwrap());
        }
        out
    }

    /// Ping-pong frames between two linked nodes until both go quiet.
    fn settle(
        a: &MeshCore,
        b: &MeshCore,
        mut from_a: Vec<Action>,
        mut from_b: Vec<Action>,
    ) -> (Vec<Delivery>, Vec<Delivery>) {
        let mut got_a = deliveries(&from_a);
        let mut got_b = deliveries(&from_b);
        for _ in 0..32 {
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            let next_b = relay(a, b, &from_a);
            let next_a = relay(b, a, &from_b);
            got_a.extend(deliveries(&next_a));
            got_b.extend(deliveries(&next_b));
            from_a = next_a;
            from_b = next_b;
        }
        (got_a, got_b)
    }

    fn linked_pair() -> (MeshCore, MeshCore) {
        let a = node("alice");
        let b = node("bob");
        let up_a = a.on_link_established(b.peer_id());
        let up_b = b.on_link_established(a.peer_id());
        settle(&a, &b, up_a, up_b);
        (a, b)
    }

    #[test]
    fn link_up_exchanges_announces() {
        let a = node("alice");
        let b = node("bob");
        let up_a = a.on_link_established(b.peer_id());
        let up_b = b.on_link_established(a.peer_id());
        let (got_a, got_b) = settle(&a, &b, up_a, up_b);

        assert!(got_a.contains(&Delivery::PeerAnnounced {
            peer: b.peer_id(),
            nickname: "bob".into()
        }));
        assert!(got_b.contains(&Delivery::PeerAnnounced {
            peer: a.peer_id(),
            nickname: "alice".into()
        }));
        let bob = a.peers().get(b.peer_id()).unwrap();
        assert_eq!(bob.nickname, "bob");
        assert!(bob.signing_public_key.is_some());
        assert_eq!(a.topology().neighbors_of(b.peer_id()), Some(vec![a.peer_id()]));
        assert!(a.topology().edges().iter().any(|e| e.is_confirmed));
    }

    #[test]
    fn undecodable_frame_is_an_error() {
        let a = node("alice");
        let r = a.on_packet_received(PeerId::new([1; 8]), &[0x01, 0x02]);
        assert!(matches!(r, Err(MessageError::Decode(_))));
    }

    #[test]
    fn own_packets_are_ignored() {
        let a = node("alice");
        let out = a.send_public_message("echo").unwrap();
        for f in frames(&out) {
            assert!(a.on_packet_received(PeerId::new([1; 8]), &f).unwrap().is_empty());
        }
    }

    #[test]
    fn public_message_delivered_and_forwarded_once() {
        let a = node("alice");
        let b = node("bob");
        let c = node("carol");
        b.on_link_established(a.peer_id());
        b.on_link_established(c.peer_id());

        let sent = a.send_public_message("hello mesh").unwrap();
        let frame = &frames(&sent)[0];
        let out = b.on_packet_received(a.peer_id(), frame).unwrap();

        let delivered = deliveries(&out);
        assert!(matches!(
            &delivered[..],
            [Delivery::PublicMessage { from, text, .. }] if *from == a.peer_id() && text == "hello mesh"
        ));
        let forwarded = out
            .iter()
            .find_map(|act| match act {
                Action::Broadcast { bytes, exclude } => {
                    assert_eq!(*exclude, Some(a.peer_id()));
                    Some(wire::decode(bytes).unwrap())
                }
                _ => None,
            })
            .expect("message is flooded onward");
        assert_eq!(forwarded.ttl, Config::default().default_ttl - 1);
        assert!(forwarded.signature.is_some());

        assert!(b.on_packet_received(a.peer_id(), frame).unwrap().is_empty());
    }

    #[test]
    fn last_hop_is_not_forwarded() {
        let a = node("alice");
        let b = node("bob");
        b.on_link_established(a.peer_id());
        let packet = Packet::new(MessageType::Message, a.peer_id(), b"hi".to_vec()).with_ttl(1);
        let out = b
            .on_packet_received(a.peer_id(), &wire::encode(&packet).unwrap())
            .unwrap();
        assert_eq!(frames(&out).len(), 0);
        assert_eq!(deliveries(&out).len(), 1);
    }

    #[test]
    fn forged_announce_rejected() {
        let a = node("alice");
        let b = node("bob");
        let sent = a.announce().unwrap();
        let mut packet = wire::decode(&frames(&sent)[0]).unwrap();
        let mut announcement = Announcement::decode(&packet.payload).unwrap();
        announcement.nickname = "mallory".into();
        packet.payload = announcement.encode().unwrap();

        let out = b
            .on_packet_received(a.peer_id(), &wire::encode(&packet).unwrap())
            .unwrap();
        assert!(deliveries(&out).is_empty());
        assert!(b.peers().get(a.peer_id()).is_none());
    }

    #[test]
    fn known_sender_must_sign_public_messages() {
        let (a, b) = linked_pair();
        let unsigned = Packet::new(MessageType::Message, a.peer_id(), b"forged".to_vec());
        let out = b
            .on_packet_received(a.peer_id(), &wire::encode(&unsigned).unwrap())
            .unwrap();
        assert!(deliveries(&out).is_empty());
    }

    #[test]
    fn sync_response_requires_open_request() {
        let a = node("alice");
        let b = node("bob");
        let sent = a.send_public_message("catch up").unwrap();
        let original = wire::decode(&frames(&sent)[0]).unwrap();
        let response = Packet {
            ttl: 0,
            is_sync_response: true,
            ..original
        };
        let bytes = wire::encode(&response).unwrap();

        assert!(b.on_packet_received(a.peer_id(), &bytes).unwrap().is_empty());

        b.request_sync(a.peer_id()).unwrap();
        let out = b.on_packet_received(a.peer_id(), &bytes).unwrap();
        assert!(matches!(&deliveries(&out)[..], [Delivery::PublicMessage { text, .. }] if text == "catch up"));
        assert!(frames(&out).is_empty());
    }

    #[test]
    fn sync_request_answers_missing_gossip() {
        let a = node("alice");
        let b = node("bob");
        a.send_public_message("one").unwrap();
        a.send_public_message("two").unwrap();

        let request = b.request_sync(a.peer_id()).unwrap();
        let answers = relay(&b, &a, &request);
        assert_eq!(frames(&answers).len(), 2);
        for f in frames(&answers) {
            assert!(wire::decode(&f).unwrap().is_sync_response);
        }
        let got = relay(&a, &b, &answers);
        assert_eq!(deliveries(&got).len(), 2);
    }

    #[test]
    fn private_message_over_fresh_session() {
        let (a, b) = linked_pair();
        let (message_id, out) = a.send_private_message(b.peer_id(), "secret").unwrap();
        let (got_a, got_b) = settle(&a, &b, out, Vec::new());

        assert!(got_b.iter().any(|d| matches!(
            d,
            Delivery::PrivateMessage { text, message_id: id, .. } if text == "secret" && *id == message_id
        )));
        assert!(got_b
            .iter()
            .any(|d| matches!(d, Delivery::SessionEstablished { peer, .. } if *peer == a.peer_id())));
        assert!(got_a.contains(&Delivery::DeliveryAck {
            from: b.peer_id(),
            message_id
        }));
        assert!(a.sessions().is_established(b.peer_id()));

        let receipt = b.send_read_receipt(a.peer_id(), message_id).unwrap();
        let (got_a, _) = settle(&a, &b, Vec::new(), receipt);
        assert_eq!(
            got_a,
            vec![Delivery::ReadReceipt {
                from: b.peer_id(),
                message_id
            }]
        );
    }

    #[test]
    fn private_message_to_self_rejected() {
        let a = node("alice");
        assert!(matches!(
            a.send_private_message(a.peer_id(), "me"),
            Err(MessageError::InvalidRecipient)
        ));
    }

    #[test]
    fn large_message_travels_as_fragments() {
        let a = node("alice");
        let b = node("bob");
        let mut rng = rand::thread_rng();
        let text: String = (0..1500)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();

        let sent = a.send_public_message(&text).unwrap();
        let parts = frames(&sent);
        assert!(parts.len() > 1);
        for p in &parts {
            assert_eq!(wire::decode(p).unwrap().message_type, MessageType::Fragment);
        }

        let mut delivered = Vec::new();
        for p in parts.iter().rev() {
            delivered.extend(deliveries(&b.on_packet_received(a.peer_id(), p).unwrap()));
        }
        assert!(matches!(&delivered[..], [Delivery::PublicMessage { text: t, .. }] if *t == text));
    }

    #[test]
    fn relay_envelope_delivered_once() {
        let a = node("alice");
        let b = node("bob");
        let event = RelayEvent::new(
            String::new(),
            1_700_000_000,
            KIND_GEOHASH_CHAT,
            vec![vec!["g".into(), "u4pru".into()]],
            "from the relay".into(),
        )
        .unwrap()
        .sign(&RelayKeypair::generate())
        .unwrap();
        let envelope = RelayEnvelope::Event(event);

        let first = relay(&a, &b, &a.send_relay_envelope(&envelope).unwrap());
        assert_eq!(
            deliveries(&first),
            vec![Delivery::RelayEvent {
                from: a.peer_id(),
                envelope: envelope.clone()
            }]
        );
        let again = relay(&a, &b, &a.send_relay_envelope(&envelope).unwrap());
        assert!(deliveries(&again).is_empty());
    }

    #[test]
    fn forged_relay_event_does_not_shadow_genuine() {
        let a = node("alice");
        let b = node("bob");
        let genuine = RelayEvent::new(
            String::new(),
            1_700_000_000,
            KIND_GEOHASH_CHAT,
            vec![vec!["g".into(), "u4pru".into()]],
            "meet at noon".into(),
        )
        .unwrap()
        .sign(&RelayKeypair::generate())
        .unwrap();
        let mut altered = genuine.clone();
        altered.content = "meet at midnight".into();
        let forged = RelayEnvelope::Event(altered);

        assert!(matches!(
            a.send_relay_envelope(&forged),
            Err(MessageError::InvalidRelayEvent)
        ));
        let smuggled = Packet::new(MessageType::RelayBridge, a.peer_id(), forged.encode().unwrap());
        let out = b
            .on_packet_received(a.peer_id(), &wire::encode(&smuggled).unwrap())
            .unwrap();
        assert!(deliveries(&out).is_empty());

        let envelope = RelayEnvelope::Event(genuine);
        let out = relay(&a, &b, &a.send_relay_envelope(&envelope).unwrap());
        assert_eq!(
            deliveries(&out),
            vec![Delivery::RelayEvent {
                from: a.peer_id(),
                envelope
            }]
        );
    }

    #[test]
    fn sync_response_respects_mtu() {
        let a = node("alice");
        let b = node("bob");
        let mut rng = rand::thread_rng();
        let text: String = (0..1500)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        a.send_public_message(&text).unwrap();

        let answers = relay(&b, &a, &b.request_sync(a.peer_id()).unwrap());
        let parts = frames(&answers);
        assert!(parts.len() > 1);
        for p in &parts {
            assert!(p.len() <= a.config().mtu, "frame of {} bytes", p.len());
            let packet = wire::decode(p).unwrap();
            assert_eq!(packet.message_type, MessageType::Fragment);
            assert!(packet.is_sync_response);
        }
        assert!(answers
            .iter()
            .all(|act| matches!(act, Action::Send { to, .. } if *to == b.peer_id())));

        let got = relay(&a, &b, &answers);
        assert!(frames(&got).is_empty());
        assert!(matches!(&deliveries(&got)[..], [Delivery::PublicMessage { text: t, .. }] if *t == text));
    }

    #[test]
    fn stalled_handshake_retried_then_abandoned() {
        let config = Config {
            handshake_timeout_secs: 0,
            handshake_retries: 1,
            max_pending_messages: 2,
            announce_interval_ticks: 0,
            ..Config::default()
        };
        let a = MeshCore::new(Identity::generate(), "alice", config);
        let unreachable = PeerId::new([7; 8]);
        let is_handshake = |f: &Vec<u8>| {
            wire::decode(f).unwrap().message_type == MessageType::NoiseHandshake
        };

        let (_, out) = a.send_private_message(unreachable, "one").unwrap();
        assert!(frames(&out).iter().any(is_handshake));
        a.send_private_message(unreachable, "two").unwrap();
        assert!(matches!(
            a.send_private_message(unreachable, "three"),
            Err(MessageError::QueueFull)
        ));

        let retry = a.tick();
        assert!(frames(&retry).iter().any(is_handshake));
        assert_eq!(a.sessions().phase(unreachable), SessionPhase::Handshaking);

        assert!(a.tick().is_empty());
        assert_eq!(a.sessions().phase(unreachable), SessionPhase::Failed);

        // The queue was dropped, so sending starts over.
        let (_, out) = a.send_private_message(unreachable, "four").unwrap();
        assert!(frames(&out).iter().any(is_handshake));
        a.send_private_message(unreachable, "five").unwrap();
        assert!(a.send_private_message(unreachable, "six").is_err());
    }

    #[test]
    fn leave_removes_peer() {
        let (a, b) = linked_pair();
        let out = relay(&a, &b, &a.leave().unwrap());
        assert_eq!(deliveries(&out), vec![Delivery::PeerLeft { peer: a.peer_id() }]);
        assert!(b.peers().get(a.peer_id()).is_none());
        assert!(b.topology().neighbors_of(a.peer_id()).is_none());
    }

    #[test]
    fn replayed_announce_cannot_undo_leave() {
        let (a, b) = linked_pair();
        relay(&a, &b, &a.leave().unwrap());
        assert!(b.peers().get(a.peer_id()).is_none());

        let earlier = Announcement {
            nickname: "alice".into(),
            noise_public_key: *a.identity.noise().public_key(),
            signing_public_key: a.identity.signing().public_key(),
            neighbors: Some(vec![b.peer_id()]),
        };
        let replay = Packet::new(MessageType::Announce, a.peer_id(), earlier.encode().unwrap())
            .with_timestamp(crate::packet::now_millis() - 60_000)
            .sign(a.identity.signing())
            .unwrap();
        let out = b
            .on_packet_received(a.peer_id(), &wire::encode(&replay).unwrap())
            .unwrap();
        assert!(deliveries(&out).is_empty());
        assert!(b.peers().get(a.peer_id()).is_none());
        assert!(b.topology().neighbors_of(a.peer_id()).is_none());

        // Announces must be strictly newer than the leave.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let back = relay(&a, &b, &a.announce().unwrap());
        assert!(back
            .iter()
            .any(|act| matches!(act, Action::Deliver(Delivery::PeerAnnounced { peer, .. }) if *peer == a.peer_id())));
    }

    #[test]
    fn tick_announces_on_interval() {
        let config = Config {
            announce_interval_ticks: 2,
            ..Config::default()
        };
        let a = MeshCore::new(Identity::generate(), "alice", config);
        assert!(frames(&a.tick()).is_empty());
        let second = a.tick();
        let announce = wire::decode(&frames(&second)[0]).unwrap();
        assert_eq!(announce.message_type, MessageType::Announce);
    }

    #[test]
    fn lost_link_drops_session() {
        let (a, b) = linked_pair();
        let (_, out) = a.send_private_message(b.peer_id(), "hi").unwrap();
        settle(&a, &b, out, Vec::new());
        assert!(a.sessions().is_established(b.peer_id()));

        let out = a.on_link_lost(b.peer_id());
        assert!(!a.sessions().is_established(b.peer_id()));
        assert!(a.links().is_empty());
        let announce = wire::decode(&frames(&out)[0]).unwrap();
        let body = Announcement::decode(&announce.payload).unwrap();
        assert_eq!(body.neighbors, Some(Vec::new()));
    }
}
