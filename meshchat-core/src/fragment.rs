//! Fragmentation: split an encoded packet into `Fragment` packets, buffer and reassemble.
//!
//! Fragment payload header: fragment_id (8) + index (2, BE) + count (2, BE) + original type (1),
//! followed by one slice of the original packet's encoded bytes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::identity::PeerId;
use crate::packet::Packet;
use crate::protocol::MessageType;

pub const FRAGMENT_HEADER_SIZE: usize = 8 + 2 + 2 + 1;

/// Default slice size per fragment.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 469;

/// Upper bound on fragments per set; larger sets are refused outright.
pub const MAX_FRAGMENTS_PER_SET: u16 = 256;

pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Reassembly key: who sent it and which fragment set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub sender: PeerId,
    pub fragment_id: [u8; 8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: [u8; 8],
    pub index: u16,
    pub count: u16,
    pub original_type: MessageType,
}

impl FragmentHeader {
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), FragmentError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::TooShort);
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let count = u16::from_be_bytes([payload[10], payload[11]]);
        let original_type =
            MessageType::from_byte(payload[12]).ok_or(FragmentError::UnknownType(payload[12]))?;
        if count == 0 || count > MAX_FRAGMENTS_PER_SET {
            return Err(FragmentError::BadCount(count));
        }
        if index >= count {
            return Err(FragmentError::IndexOutOfRange { index, count });
        }
        Ok((
            Self {
                fragment_id,
                index,
                count,
                original_type,
            },
            &payload[FRAGMENT_HEADER_SIZE..],
        ))
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.fragment_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.push(self.original_type.as_byte());
    }
}

/// Split `encoded` (the unpadded encoding of `original`) into fragment packets that keep the
/// original's version, ttl, timestamp, sender, recipient and sync-response flag.
pub fn split_into_fragments(
    original: &Packet,
    encoded: &[u8],
    max_fragment_size: usize,
) -> Result<Vec<Packet>, FragmentError> {
    let size = if max_fragment_size == 0 {
        DEFAULT_MAX_FRAGMENT_SIZE
    } else {
        max_fragment_size
    };
    let count = encoded.len().div_ceil(size);
    if count == 0 || count > MAX_FRAGMENTS_PER_SET as usize {
        return Err(FragmentError::BadCount(count.min(u16::MAX as usize) as u16));
    }
    let mut fragment_id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut fragment_id);

    let fragments = encoded
        .chunks(size)
        .enumerate()
        .map(|(i, slice)| {
            let header = FragmentHeader {
                fragment_id,
                index: i as u16,
                count: count as u16,
                original_type: original.message_type,
            };
            let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + slice.len());
            header.write(&mut payload);
            payload.extend_from_slice(slice);
            Packet {
                message_type: MessageType::Fragment,
                payload,
                signature: None,
                route: None,
                ..original.clone()
            }
        })
        .collect();
    Ok(fragments)
}

struct FragmentSet {
    count: u16,
    original_type: MessageType,
    received: HashMap<u16, Vec<u8>>,
    started: Instant,
}

impl FragmentSet {
    fn is_complete(&self) -> bool {
        self.received.len() == self.count as usize
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..self.count {
            if let Some(slice) = self.received.get(&i) {
                out.extend_from_slice(slice);
            }
        }
        out
    }
}

/// Result of feeding one fragment to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum FragmentResult {
    /// Set complete: encoded bytes of the original packet, ready for `wire::decode`.
    Complete {
        original_type: MessageType,
        bytes: Vec<u8>,
    },
    InProgress,
}

/// Buffers incomplete fragment sets. Sets expire after `timeout`; at most `max_sets`
/// are held, evicting the oldest when full.
pub struct FragmentReassembler {
    sets: HashMap<FragmentKey, FragmentSet>,
    timeout: Duration,
    max_sets: usize,
}

impl FragmentReassembler {
    pub fn new(timeout: Duration, max_sets: usize) -> Self {
        Self {
            sets: HashMap::new(),
            timeout,
            max_sets: max_sets.max(1),
        }
    }

    pub fn on_fragment(
        &mut self,
        sender: PeerId,
        payload: &[u8],
    ) -> Result<FragmentResult, FragmentError> {
        self.on_fragment_at(sender, payload, Instant::now())
    }

    pub fn on_fragment_at(
        &mut self,
        sender: PeerId,
        payload: &[u8],
        now: Instant,
    ) -> Result<FragmentResult, FragmentError> {
        let (header, slice) = FragmentHeader::parse(payload)?;
        let key = FragmentKey {
            sender,
            fragment_id: header.fragment_id,
        };

        if !self.sets.contains_key(&key) && self.sets.len() >= self.max_sets {
            self.evict_oldest();
        }
        let set = self.sets.entry(key).or_insert_with(|| FragmentSet {
            count: header.count,
            original_type: header.original_type,
            received: HashMap::new(),
            started: now,
        });
        if set.count != header.count || set.original_type != header.original_type {
            return Err(FragmentError::InconsistentSet);
        }
        set.received.insert(header.index, slice.to_vec());

        if !set.is_complete() {
            return Ok(FragmentResult::InProgress);
        }
        let bytes = set.reassemble();
        let original_type = set.original_type;
        self.sets.remove(&key);
        Ok(FragmentResult::Complete {
            original_type,
            bytes,
        })
    }

    /// Drop sets older than the timeout. Returns how many were dropped.
    pub fn cleanup_at(&mut self, now: Instant) -> usize {
        let before = self.sets.len();
        let timeout = self.timeout;
        self.sets
            .retain(|_, set| now.saturating_duration_since(set.started) < timeout);
        before - self.sets.len()
    }

    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.started)
            .map(|(k, _)| *k)
        {
            self.sets.remove(&key);
        }
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT, 128)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    #[error("fragment shorter than its header")]
    TooShort,
    #[error("unknown original message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("invalid fragment count {0}")]
    BadCount(u16),
    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange { index: u16, count: u16 },
    #[error("fragment disagrees with its set's count or type")]
    InconsistentSet,
}
