//! Mesh chat reference core.
//! Host-driven: no I/O; the host feeds link events and frames, and carries out the
//! returned actions.

pub mod announce;
pub mod compression;
pub mod config;
pub mod core;
pub mod fragment;
pub mod identity;
pub mod noise;
pub mod packet;
pub mod padding;
pub mod peers;
pub mod protocol;
pub mod relay;
pub mod sync;
pub mod token;
pub mod topology;
pub mod wire;

pub use crate::core::{Action, Delivery, MeshCore, MessageError, MessageId};
pub use config::Config;
pub use identity::{Identity, IdentityError, IdentityStore, MemoryIdentityStore, PeerId, StoredIdentity};
pub use packet::{Packet, PacketId};
pub use protocol::{MessageType, NoisePayloadType, MAX_SUPPORTED_VERSION};
pub use wire::{decode, encode, DecodeError, EncodeError};
