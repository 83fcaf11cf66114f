//! Binary packet codec.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! version:1 type:1 ttl:1 timestamp:8 flags:1 payload_len:2
//! sender:8 [recipient:8] [original_size:2] payload [signature:64] [route_count:1 route:8*n]
//! ```
//!
//! `payload_len` counts the original-size field when the payload is compressed. The route
//! block exists only for version 2+ with `HAS_ROUTE` set; its position follows from the
//! fields already parsed, so no byte of the sender ID or payload is ever read as a count.
//! Encoded buffers are padded to a block size; [`decode`] accepts padded and unpadded input.

use crate::compression;
use crate::identity::{PeerId, PEER_ID_LEN};
use crate::packet::Packet;
use crate::padding;
use crate::protocol::{flags, MessageType, MAX_SUPPORTED_VERSION, PROTOCOL_VERSION_1, PROTOCOL_VERSION_2};

/// Fixed header: version, type, ttl, timestamp, flags, payload length.
pub const HEADER_SIZE: usize = 1 + 1 + 1 + 8 + 1 + 2;
pub const SIGNATURE_SIZE: usize = 64;
const ORIGINAL_SIZE_LEN: usize = 2;
const MAX_ROUTE_HOPS: usize = u8::MAX as usize;

/// Encode with compression and block padding. This is what goes on the link.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let raw = encode_unpadded(packet)?;
    let target = padding::optimal_block_size(raw.len());
    Ok(padding::pad(raw, target))
}

/// Encode with compression but without padding. Used to size fragments.
pub fn encode_unpadded(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    encode_raw(packet, true)
}

/// Uncompressed, unpadded encoding; input to packet signatures.
pub(crate) fn encode_canonical(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    encode_raw(packet, false)
}

fn encode_raw(packet: &Packet, allow_compression: bool) -> Result<Vec<u8>, EncodeError> {
    if packet.version < PROTOCOL_VERSION_1 || packet.version > MAX_SUPPORTED_VERSION {
        return Err(EncodeError::UnsupportedVersion(packet.version));
    }

    let compressed = if allow_compression && compression::should_compress(&packet.payload) {
        compression::compress(&packet.payload)
    } else {
        None
    };
    let (body, original_size) = match &compressed {
        Some(c) => {
            let original =
                u16::try_from(packet.payload.len()).map_err(|_| EncodeError::PayloadTooLarge)?;
            (c.as_slice(), Some(original))
        }
        None => (packet.payload.as_slice(), None),
    };
    let payload_len = body.len() + original_size.map_or(0, |_| ORIGINAL_SIZE_LEN);
    let payload_len = u16::try_from(payload_len).map_err(|_| EncodeError::PayloadTooLarge)?;

    // Version 1 never carries a route, whatever the caller supplied.
    let route = match &packet.route {
        Some(r) if packet.version >= PROTOCOL_VERSION_2 => {
            if r.len() > MAX_ROUTE_HOPS {
                return Err(EncodeError::RouteTooLong(r.len()));
            }
            Some(r)
        }
        _ => None,
    };

    let mut flag_bits = 0u8;
    if packet.recipient_id.is_some() {
        flag_bits |= flags::HAS_RECIPIENT;
    }
    if packet.signature.is_some() {
        flag_bits |= flags::HAS_SIGNATURE;
    }
    if original_size.is_some() {
        flag_bits |= flags::IS_COMPRESSED;
    }
    if route.is_some() {
        flag_bits |= flags::HAS_ROUTE;
    }
    if packet.is_sync_response {
        flag_bits |= flags::IS_SYNC_RESPONSE;
    }

    let mut out = Vec::with_capacity(
        HEADER_SIZE + 2 * PEER_ID_LEN + payload_len as usize + SIGNATURE_SIZE,
    );
    out.push(packet.version);
    out.push(packet.message_type.as_byte());
    out.push(packet.ttl);
    out.extend_from_slice(&packet.timestamp.to_be_bytes());
    out.push(flag_bits);
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        out.extend_from_slice(recipient.as_bytes());
    }
    if let Some(original) = original_size {
        out.extend_from_slice(&original.to_be_bytes());
    }
    out.extend_from_slice(body);
    if let Some(signature) = &packet.signature {
        out.extend_from_slice(signature);
    }
    if let Some(route) = route {
        out.push(route.len() as u8);
        for hop in route {
            out.extend_from_slice(hop.as_bytes());
        }
    }
    Ok(out)
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("payload too large for the 16-bit length field")]
    PayloadTooLarge,
    #[error("route of {0} hops exceeds the 255-hop limit")]
    RouteTooLong(usize),
}

/// Decode a packet. Tries the bytes as-is first, then with padding stripped.
/// Decoding is all-or-nothing: any inconsistency is an error, never a partial packet.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    match decode_raw(bytes) {
        Ok(packet) => Ok(packet),
        Err(err) => {
            let unpadded = padding::unpad(bytes);
            if unpadded.len() == bytes.len() {
                return Err(err);
            }
            decode_raw(unpadded)
        }
    }
}

/// Error decoding a packet. All variants mean "drop it".
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need {needed} bytes at offset {offset}, only {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("compressed payload shorter than its size field")]
    BadCompressedLength,
    #[error("{0} bytes after the last field that are not padding")]
    TrailingBytes(usize),
    #[error("decompression failed: {0}")]
    Decompression(#[from] compression::CompressionError),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn peer_id(&mut self) -> Result<PeerId, DecodeError> {
        Ok(PeerId::from_slice(self.take(PEER_ID_LEN)?))
    }
}

fn decode_raw(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = Reader::new(bytes);
    let version = r.u8()?;
    if !(PROTOCOL_VERSION_1..=MAX_SUPPORTED_VERSION).contains(&version) {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let type_byte = r.u8()?;
    let message_type = MessageType::from_byte(type_byte).ok_or(DecodeError::UnknownType(type_byte))?;
    let ttl = r.u8()?;
    let timestamp = r.u64()?;
    let flag_bits = r.u8()?;
    let payload_len = r.u16()? as usize;

    let sender_id = r.peer_id()?;
    let recipient_id = if flag_bits & flags::HAS_RECIPIENT != 0 {
        Some(r.peer_id()?)
    } else {
        None
    };

    let payload = if flag_bits & flags::IS_COMPRESSED != 0 {
        if payload_len < ORIGINAL_SIZE_LEN {
            return Err(DecodeError::BadCompressedLength);
        }
        let original_size = r.u16()? as usize;
        let body = r.take(payload_len - ORIGINAL_SIZE_LEN)?;
        compression::decompress(body, original_size)?
    } else {
        r.take(payload_len)?.to_vec()
    };

    let signature = if flag_bits & flags::HAS_SIGNATURE != 0 {
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(r.take(SIGNATURE_SIZE)?);
        Some(sig)
    } else {
        None
    };

    let route = if version >= PROTOCOL_VERSION_2 && flag_bits & flags::HAS_ROUTE != 0 {
        let count = r.u8()? as usize;
        let mut hops = Vec::with_capacity(count);
        for _ in 0..count {
            hops.push(r.peer_id()?);
        }
        Some(hops)
    } else {
        None
    };

    let trailing = bytes.len() - r.pos;
    if trailing > 0 {
        return Err(DecodeError::TrailingBytes(trailing));
    }

    Ok(Packet {
        version,
        message_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        payload,
        signature,
        route,
        is_sync_response: flag_bits & flags::IS_SYNC_RESPONSE != 0,
    })
}
