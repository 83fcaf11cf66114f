//! Geochannel fan-in: relay events for one geohash become chat messages, or are skipped.

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::debug;

use super::dedup::{DedupCache, DedupStats};
use super::event::{EventError, RelayEvent, RelayKeypair, KIND_GEOHASH_CHAT};
use super::pow::{self, MiningOutcome, NONCE_TAG};
use crate::token::find_payment_token;

pub const DEFAULT_RELAY_DEDUP_CAPACITY: usize = 1000;

/// Upper bound on nonce attempts when composing a post.
pub const DEFAULT_MINING_ATTEMPTS: u64 = 1 << 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_pubkey: String,
    /// `nickname#abcd` or `anon#abcd`, the suffix being the last four hex digits of the key.
    pub display_name: String,
    pub content: String,
    pub created_at: u64,
    pub geohash: String,
    /// Observed work for mined events.
    pub pow_difficulty: Option<u32>,
    pub payment_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    WrongKind,
    WrongChannel,
    Duplicate,
    InvalidId,
    InvalidSignature,
    InsufficientWork,
    Blocked,
    OwnEcho,
    PresenceMarker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Delivered(ChatMessage),
    Skipped(SkipReason),
}

/// One subscribed geohash channel.
pub struct GeoChannelFeed {
    geohash: String,
    self_pubkey: String,
    dedup: DedupCache<String>,
    min_difficulty: i32,
    blocked: RwLock<HashSet<String>>,
}

impl GeoChannelFeed {
    pub fn new(geohash: &str, self_pubkey: String, min_difficulty: i32, dedup_capacity: usize) -> Self {
        Self {
            geohash: geohash.to_ascii_lowercase(),
            self_pubkey,
            dedup: DedupCache::new(dedup_capacity),
            min_difficulty,
            blocked: RwLock::new(HashSet::new()),
        }
    }

    pub fn geohash(&self) -> &str {
        &self.geohash
    }

    pub fn block(&self, pubkey: &str) {
        self.blocked.write().insert(pubkey.to_ascii_lowercase());
    }

    pub fn unblock(&self, pubkey: &str) -> bool {
        self.blocked.write().remove(&pubkey.to_ascii_lowercase())
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub fn ingest(&self, event: &RelayEvent) -> IngestOutcome {
        let outcome = self.classify(event);
        if let IngestOutcome::Skipped(reason) = &outcome {
            debug!(id = %event.id, ?reason, "geochannel event skipped");
        }
        outcome
    }

    fn classify(&self, event: &RelayEvent) -> IngestOutcome {
        use IngestOutcome::Skipped;

        if event.kind != KIND_GEOHASH_CHAT {
            return Skipped(SkipReason::WrongKind);
        }
        if !event
            .tag_value("g")
            .is_some_and(|g| g.eq_ignore_ascii_case(&self.geohash))
        {
            return Skipped(SkipReason::WrongChannel);
        }
        // Only authentic ids may enter the seen set, or a forgery could shadow the real event.
        if !event.verify_id() {
            return Skipped(SkipReason::InvalidId);
        }
        if !event.verify_signature() {
            return Skipped(SkipReason::InvalidSignature);
        }
        if self.dedup.is_duplicate(event.id.clone()) {
            return Skipped(SkipReason::Duplicate);
        }
        if !pow::validate_difficulty(event, self.min_difficulty) {
            return Skipped(SkipReason::InsufficientWork);
        }
        if self.blocked.read().contains(&event.pubkey.to_ascii_lowercase()) {
            return Skipped(SkipReason::Blocked);
        }
        if event.pubkey.eq_ignore_ascii_case(&self.self_pubkey) {
            return Skipped(SkipReason::OwnEcho);
        }
        if event.has_tag("t", "teleport") && event.content.trim().is_empty() {
            return Skipped(SkipReason::PresenceMarker);
        }

        let pow_difficulty = event
            .tag(NONCE_TAG)
            .map(|_| pow::calculate_difficulty(&event.id))
            .filter(|d| *d > 0);
        IngestOutcome::Delivered(ChatMessage {
            id: event.id.clone(),
            sender_pubkey: event.pubkey.clone(),
            display_name: display_name(event),
            content: event.content.clone(),
            created_at: event.created_at,
            geohash: self.geohash.clone(),
            pow_difficulty,
            payment_token: find_payment_token(&event.content).map(str::to_string),
        })
    }

    /// Build, mine (when the channel requires work) and sign a post for this channel.
    /// The returned event is also marked as seen so its relay echo is ignored.
    pub fn compose(
        &self,
        keys: &RelayKeypair,
        content: &str,
        nickname: Option<&str>,
        created_at: u64,
    ) -> Result<RelayEvent, ComposeError> {
        let mut tags = vec![vec!["g".to_string(), self.geohash.clone()]];
        if let Some(nick) = nickname {
            tags.push(vec!["n".to_string(), nick.to_string()]);
        }
        let event = RelayEvent::new(
            keys.public_key_hex(),
            created_at,
            KIND_GEOHASH_CHAT,
            tags,
            content.to_string(),
        )?;
        let event = if self.min_difficulty > 0 {
            match pow::mine(event, self.min_difficulty as u32, DEFAULT_MINING_ATTEMPTS)? {
                MiningOutcome::Found { event, .. } => event,
                MiningOutcome::Exhausted { attempts } => {
                    return Err(ComposeError::MiningExhausted(attempts))
                }
            }
        } else {
            event
        };
        let signed = event.sign(keys)?;
        self.dedup.is_duplicate(signed.id.clone());
        Ok(signed)
    }
}

fn display_name(event: &RelayEvent) -> String {
    let key = &event.pubkey;
    let suffix = key.get(key.len().saturating_sub(4)..).unwrap_or(key);
    match event.tag_value("n").map(str::trim).filter(|n| !n.is_empty()) {
        Some(nick) => format!("{nick}#{suffix}"),
        None => format!("anon#{suffix}"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("no proof of work found in {0} attempts")]
    MiningExhausted(u64),
}
