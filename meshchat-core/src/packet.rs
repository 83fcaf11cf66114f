//! The mesh packet value, its signing bytes and its dedup identity.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::identity::{self, PeerId, SigningKeypair};
use crate::protocol::{MessageType, DEFAULT_TTL, PROTOCOL_VERSION_1};
use crate::wire::{self, EncodeError};

/// 16-byte packet identity used for flood dedup and sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub [u8; 16]);

/// One packet on the wire. Forwarding produces a new value via [`Packet::relayed`];
/// nothing mutates a packet in place after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub message_type: MessageType,
    pub ttl: u8,
    /// Sender-local milliseconds since the epoch. Untrusted.
    pub timestamp: u64,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; 64]>,
    /// Source route. Only encoded for version 2 and later.
    pub route: Option<Vec<PeerId>>,
    pub is_sync_response: bool,
}

impl Packet {
    pub fn new(message_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            message_type,
            ttl: DEFAULT_TTL,
            timestamp: now_millis(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
            route: None,
            is_sync_response: false,
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.route = Some(route);
        self
    }

    /// No recipient, or the reserved all-0xFF recipient.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.map_or(true, |r| r.is_broadcast())
    }

    pub fn is_addressed_to(&self, peer: PeerId) -> bool {
        self.recipient_id == Some(peer)
    }

    /// Canonical bytes covered by the signature: ttl zeroed, no signature, no sync-response
    /// flag, uncompressed and unpadded. Stable across relaying.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let canonical = Packet {
            ttl: 0,
            signature: None,
            is_sync_response: false,
            ..self.clone()
        };
        wire::encode_canonical(&canonical)
    }

    pub fn sign(self, key: &SigningKeypair) -> Result<Self, EncodeError> {
        let signature = key.sign(&self.signing_bytes()?);
        Ok(Self {
            signature: Some(signature),
            ..self
        })
    }

    /// False when unsigned or when the signature does not match `signing_public_key`.
    pub fn verify_signature(&self, signing_public_key: &[u8; 32]) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        match self.signing_bytes() {
            Ok(bytes) => identity::verify_signature(signing_public_key, &bytes, signature),
            Err(_) => false,
        }
    }

    /// Identity over (type, sender, timestamp, payload); unaffected by ttl or relaying.
    pub fn packet_id(&self) -> PacketId {
        let mut hasher = Sha256::new();
        hasher.update([self.message_type.as_byte()]);
        hasher.update(self.sender_id.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(&self.payload);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PacketId(id)
    }

    /// Copy for forwarding with one less hop, or `None` when the hop budget is spent.
    pub fn relayed(&self) -> Option<Packet> {
        (self.ttl > 1).then(|| Packet {
            ttl: self.ttl - 1,
            ..self.clone()
        })
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
