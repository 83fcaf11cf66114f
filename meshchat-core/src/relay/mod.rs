//! Relay bridge: events, mesh envelope, dedup, proof-of-work and geochannel fan-in.

pub mod dedup;
pub mod envelope;
pub mod event;
pub mod geochannel;
pub mod pow;

pub use dedup::{DedupCache, DedupStats};
pub use envelope::{EnvelopeError, RelayEnvelope};
pub use event::{EventError, RelayEvent, RelayKeypair, KIND_GEOHASH_CHAT};
pub use geochannel::{ChatMessage, ComposeError, GeoChannelFeed, IngestOutcome, SkipReason};
pub use pow::{calculate_difficulty, mine, validate_difficulty, MiningOutcome};
