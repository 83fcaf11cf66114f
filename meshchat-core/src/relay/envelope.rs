//! Mesh envelope for relay events: tag (1) + big-endian length (4) + payload.
//!
//! Plaintext envelopes carry an event coming in from a relay. Compressed envelopes carry
//! an event a mesh peer wants a relay-connected peer to publish; the JSON is raw deflate.

use super::event::{EventError, RelayEvent};
use crate::compression::{self, CompressionError};

pub const PLAINTEXT_RELAY_EVENT: u8 = 0x01;
pub const COMPRESSED_RELAY_REQUEST: u8 = 0x02;

pub const ENVELOPE_HEADER_LEN: usize = 5;

/// Decompressed request bodies larger than this are refused.
pub const MAX_EVENT_JSON: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnvelope {
    /// Event received from a relay, forwarded into the mesh.
    Event(RelayEvent),
    /// Event to publish through a relay-connected peer.
    PublishRequest(RelayEvent),
}

impl RelayEnvelope {
    pub fn event(&self) -> &RelayEvent {
        match self {
            Self::Event(e) | Self::PublishRequest(e) => e,
        }
    }

    pub fn into_event(self) -> RelayEvent {
        match self {
            Self::Event(e) | Self::PublishRequest(e) => e,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let json = self.event().to_json()?;
        let (tag, body) = match self {
            Self::Event(_) => (PLAINTEXT_RELAY_EVENT, json.into_bytes()),
            Self::PublishRequest(_) => {
                (COMPRESSED_RELAY_REQUEST, compression::deflate(json.as_bytes())?)
            }
        };
        let len = u32::try_from(body.len()).map_err(|_| EnvelopeError::TooLarge(body.len()))?;
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + body.len());
        out.push(tag);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(EnvelopeError::TooShort(bytes.len()));
        }
        let tag = bytes[0];
        if tag != PLAINTEXT_RELAY_EVENT && tag != COMPRESSED_RELAY_REQUEST {
            return Err(EnvelopeError::UnknownTag(tag));
        }
        let declared = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        let available = bytes.len() - ENVELOPE_HEADER_LEN;
        if declared > available {
            return Err(EnvelopeError::LengthOverrun {
                declared,
                available,
            });
        }
        let body = &bytes[ENVELOPE_HEADER_LEN..ENVELOPE_HEADER_LEN + declared];
        if tag == PLAINTEXT_RELAY_EVENT {
            let json = std::str::from_utf8(body).map_err(|_| EnvelopeError::NotUtf8)?;
            return Ok(Self::Event(RelayEvent::from_json(json)?));
        }

        let inflated = compression::inflate_bounded(body, MAX_EVENT_JSON)?;
        let json = String::from_utf8(inflated).map_err(|_| EnvelopeError::NotUtf8)?;
        Ok(Self::PublishRequest(RelayEvent::from_json(&json)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope too short ({0} bytes)")]
    TooShort(usize),
    #[error("unknown envelope tag {0:#04x}")]
    UnknownTag(u8),
    #[error("declared length {declared} exceeds {available} available bytes")]
    LengthOverrun { declared: usize, available: usize },
    #[error("envelope body too large ({0} bytes)")]
    TooLarge(usize),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("event body is not UTF-8")]
    NotUtf8,
    #[error(transparent)]
    Event(#[from] EventError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::event::{RelayKeypair, KIND_GEOHASH_CHAT};

    fn signed() -> RelayEvent {
        RelayEvent::new(
            String::new(),
            1_700_000_000,
            KIND_GEOHASH_CHAT,
            vec![vec!["g".into(), "u4pru".into()]],
            "over the mesh".repeat(10),
        )
        .unwrap()
        .sign(&RelayKeypair::generate())
        .unwrap()
    }

    #[test]
    fn both_tags_roundtrip() {
        for env in [
            RelayEnvelope::Event(signed()),
            RelayEnvelope::PublishRequest(signed()),
        ] {
            let bytes = env.encode().unwrap();
            let back = RelayEnvelope::decode(&bytes).unwrap();
            assert_eq!(back, env);
            assert!(back.event().verify_signature());
        }
    }

    #[test]
    fn request_is_compressed() {
        let e = signed();
        let plain = RelayEnvelope::Event(e.clone()).encode().unwrap();
        let packed = RelayEnvelope::PublishRequest(e).encode().unwrap();
        assert_eq!(packed[0], COMPRESSED_RELAY_REQUEST);
        assert!(packed.len() < plain.len());
    }

    #[test]
    fn rejects_short_input() {
        assert!(matches!(
            RelayEnvelope::decode(&[PLAINTEXT_RELAY_EVENT, 0, 0, 0]),
            Err(EnvelopeError::TooShort(4))
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(
            RelayEnvelope::decode(&[0x09, 0, 0, 0, 0]),
            Err(EnvelopeError::UnknownTag(0x09))
        ));
    }

    #[test]
    fn oversized_request_refused() {
        let bomb = compression::deflate(&vec![b' '; MAX_EVENT_JSON + 1]).unwrap();
        let mut bytes = vec![COMPRESSED_RELAY_REQUEST];
        bytes.extend_from_slice(&(bomb.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&bomb);
        assert!(matches!(
            RelayEnvelope::decode(&bytes),
            Err(EnvelopeError::Compression(CompressionError::TooLarge(MAX_EVENT_JSON)))
        ));
    }

    #[test]
    fn rejects_length_overrun() {
        let mut bytes = RelayEnvelope::Event(signed()).encode().unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            RelayEnvelope::decode(&bytes),
            Err(EnvelopeError::LengthOverrun { .. })
        ));
    }
}
