//! What the user sees: rendered deliveries, and the optional geohash channel.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meshchat_core::peers::PeerDirectory;
use meshchat_core::relay::{
    ChatMessage, ComposeError, EventError, GeoChannelFeed, IngestOutcome, RelayEnvelope,
    RelayKeypair,
};
use meshchat_core::{Delivery, PeerId};
use tokio::sync::mpsc;

use crate::transport::Node;

/// A followed geohash channel with its derived posting key.
pub struct GeoChannel {
    feed: GeoChannelFeed,
    keys: RelayKeypair,
}

impl GeoChannel {
    pub fn new(
        geohash: &str,
        seed: &[u8],
        min_difficulty: i32,
        dedup_capacity: usize,
    ) -> Result<Self, EventError> {
        let keys = RelayKeypair::derive_for_geohash(seed, geohash)?;
        let feed = GeoChannelFeed::new(geohash, keys.public_key_hex(), min_difficulty, dedup_capacity);
        Ok(Self { feed, keys })
    }

    pub fn geohash(&self) -> &str {
        self.feed.geohash()
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key_hex()
    }

    /// A publish request for a relay-connected peer. May mine; run off the async workers.
    pub fn compose(&self, text: &str, nickname: Option<&str>) -> Result<RelayEnvelope, ComposeError> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let event = self.feed.compose(&self.keys, text, nickname, created_at)?;
        Ok(RelayEnvelope::PublishRequest(event))
    }

    pub fn ingest(&self, envelope: &RelayEnvelope) -> Option<ChatMessage> {
        match self.feed.ingest(envelope.event()) {
            IngestOutcome::Delivered(msg) => Some(msg),
            IngestOutcome::Skipped(_) => None,
        }
    }
}

fn short(peer: PeerId) -> String {
    peer.to_hex()[..8].to_string()
}

fn name(peers: &PeerDirectory, peer: PeerId) -> String {
    match peers.get(peer) {
        Some(p) if !p.nickname.is_empty() => format!("{}@{}", p.nickname, short(peer)),
        _ => short(peer),
    }
}

/// One console line for a delivery, or `None` when there is nothing to show.
pub fn render(delivery: &Delivery, peers: &PeerDirectory, geo: Option<&GeoChannel>) -> Option<String> {
    let line = match delivery {
        Delivery::PublicMessage {
            from,
            text,
            payment_token,
            ..
        } => {
            let tip = if payment_token.is_some() { " [ecash]" } else { "" };
            format!("<{}> {text}{tip}", name(peers, *from))
        }
        Delivery::PrivateMessage {
            from,
            text,
            payment_token,
            ..
        } => {
            let tip = if payment_token.is_some() { " [ecash]" } else { "" };
            format!("[dm <{}>] {text}{tip}", name(peers, *from))
        }
        Delivery::DeliveryAck { from, .. } => format!("(delivered to {})", name(peers, *from)),
        Delivery::ReadReceipt { from, .. } => format!("(read by {})", name(peers, *from)),
        Delivery::PeerAnnounced { peer, nickname } => format!("* {nickname}@{} is here", short(*peer)),
        Delivery::PeerLeft { peer } => format!("* {} left", short(*peer)),
        Delivery::SessionEstablished { peer, fingerprint } => format!(
            "* secure session with {} (fingerprint {})",
            name(peers, *peer),
            &fingerprint[..16.min(fingerprint.len())]
        ),
        Delivery::RelayEvent { envelope, .. } => {
            let msg = geo?.ingest(envelope)?;
            format!("[#{}] <{}> {}", msg.geohash, msg.display_name, msg.content)
        }
    };
    Some(line)
}

pub async fn run_deliveries(
    node: Arc<Node>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    geo: Option<Arc<GeoChannel>>,
) {
    while let Some(delivery) = rx.recv().await {
        if let Some(line) = render(&delivery, node.core().peers(), geo.as_deref()) {
            println!("{line}");
        }
    }
}
