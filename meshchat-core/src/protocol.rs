//! Mesh wire protocol: versions, message types, flags and Noise payload sub-types.

/// Original format: no route block.
pub const PROTOCOL_VERSION_1: u8 = 1;
/// Adds the optional source-route block.
pub const PROTOCOL_VERSION_2: u8 = 2;
/// Highest version this implementation understands. Anything above is rejected.
pub const MAX_SUPPORTED_VERSION: u8 = PROTOCOL_VERSION_2;

/// Default hop budget for packets we originate.
pub const DEFAULT_TTL: u8 = 7;

/// Top-level packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Signed presence + identity + neighbour list.
    Announce = 0x01,
    /// Public (broadcast) chat message.
    Message = 0x02,
    /// Graceful departure.
    Leave = 0x03,
    /// Noise XX handshake message.
    NoiseHandshake = 0x10,
    /// Noise transport message carrying a [`NoisePayloadType`]-tagged plaintext.
    NoiseEncrypted = 0x11,
    /// One piece of a larger encoded packet.
    Fragment = 0x20,
    /// Ask a neighbour for public packets we are missing.
    RequestSync = 0x21,
    /// Relay event carried in a mesh envelope.
    RelayBridge = 0x30,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Announce,
            0x02 => Self::Message,
            0x03 => Self::Leave,
            0x10 => Self::NoiseHandshake,
            0x11 => Self::NoiseEncrypted,
            0x20 => Self::Fragment,
            0x21 => Self::RequestSync,
            0x30 => Self::RelayBridge,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Public packets kept for sync replay.
    pub fn is_gossiped(self) -> bool {
        matches!(self, Self::Announce | Self::Message)
    }
}

/// Header flag bits.
pub mod flags {
    pub const HAS_RECIPIENT: u8 = 0x01;
    pub const HAS_SIGNATURE: u8 = 0x02;
    pub const IS_COMPRESSED: u8 = 0x04;
    /// Version 2 and later only.
    pub const HAS_ROUTE: u8 = 0x08;
    pub const IS_SYNC_RESPONSE: u8 = 0x10;
}

/// First plaintext byte inside a Noise transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NoisePayloadType {
    PrivateMessage = 0x01,
    ReadReceipt = 0x02,
    Delivered = 0x03,
    ChannelKey = 0x04,
    VersionHello = 0x05,
    IdentityAnnounce = 0x06,
}

impl NoisePayloadType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::PrivateMessage,
            0x02 => Self::ReadReceipt,
            0x03 => Self::Delivered,
            0x04 => Self::ChannelKey,
            0x05 => Self::VersionHello,
            0x06 => Self::IdentityAnnounce,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_bytes_roundtrip() {
        for t in [
            MessageType::Announce,
            MessageType::Message,
            MessageType::Leave,
            MessageType::NoiseHandshake,
            MessageType::NoiseEncrypted,
            MessageType::Fragment,
            MessageType::RequestSync,
            MessageType::RelayBridge,
        ] {
            assert_eq!(MessageType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(MessageType::from_byte(0x7F), None);
    }

    #[test]
    fn noise_payload_unknown_byte() {
        assert_eq!(NoisePayloadType::from_byte(0x00), None);
        assert_eq!(
            NoisePayloadType::from_byte(0x03),
            Some(NoisePayloadType::Delivered)
        );
    }
}
