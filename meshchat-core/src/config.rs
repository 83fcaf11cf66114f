//! Tunables for [`crate::MeshCore`]. Hosts usually deserialize this from a `[core]` table.

use std::time::Duration;

use serde::Deserialize;

use crate::fragment::DEFAULT_MAX_FRAGMENT_SIZE;
use crate::protocol::{DEFAULT_TTL, MAX_SUPPORTED_VERSION, PROTOCOL_VERSION_1};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Version emitted on packets we originate (1 or 2). Version 2 carries source routes.
    pub protocol_version: u8,
    pub default_ttl: u8,
    /// Seconds a sync request stays open for responses.
    pub sync_window_secs: u64,
    /// Seconds before an incomplete fragment set is discarded.
    pub fragment_timeout_secs: u64,
    pub max_fragment_size: usize,
    /// Encoded packets larger than this are fragmented.
    pub mtu: usize,
    pub max_fragment_sets: usize,
    pub packet_dedup_capacity: usize,
    pub relay_dedup_capacity: usize,
    pub gossip_capacity: usize,
    /// Geochannel proof-of-work floor; 0 disables the check.
    pub min_pow_difficulty: i32,
    pub decrypt_failure_threshold: u32,
    /// Announce every N ticks; 0 disables periodic announces.
    pub announce_interval_ticks: u64,
    /// Upper bound on links in a computed source route.
    pub max_route_hops: usize,
    /// Seconds a Noise handshake may stall before it is abandoned. 0 abandons it at the
    /// next tick.
    pub handshake_timeout_secs: u64,
    /// Fresh handshakes tried after a timeout while messages are still queued.
    pub handshake_retries: u32,
    /// Private payloads queued per peer while its session is being set up.
    pub max_pending_messages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_1,
            default_ttl: DEFAULT_TTL,
            sync_window_secs: 30,
            fragment_timeout_secs: 30,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            mtu: 512,
            max_fragment_sets: 128,
            packet_dedup_capacity: 4096,
            relay_dedup_capacity: 1000,
            gossip_capacity: 500,
            min_pow_difficulty: 0,
            decrypt_failure_threshold: 3,
            announce_interval_ticks: 30,
            max_route_hops: 7,
            handshake_timeout_secs: 10,
            handshake_retries: 2,
            max_pending_messages: 64,
        }
    }
}

impl Config {
    pub fn sync_window(&self) -> Duration {
        Duration::from_secs(self.sync_window_secs)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.fragment_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Clamp out-of-range values into their valid ranges.
    pub fn normalized(mut self) -> Self {
        self.protocol_version = self.protocol_version.clamp(PROTOCOL_VERSION_1, MAX_SUPPORTED_VERSION);
        self.default_ttl = self.default_ttl.max(1);
        self.max_fragment_size = self.max_fragment_size.max(1);
        self.mtu = self.mtu.max(64);
        self.max_fragment_sets = self.max_fragment_sets.max(1);
        self.packet_dedup_capacity = self.packet_dedup_capacity.max(1);
        self.relay_dedup_capacity = self.relay_dedup_capacity.max(1);
        self.decrypt_failure_threshold = self.decrypt_failure_threshold.max(1);
        self.max_pending_messages = self.max_pending_messages.max(1);
        self
    }
}
