//! Proof-of-work over event ids: leading zero bits, a `nonce` tag, and a bounded miner.

use tracing::debug;

use super::event::{EventError, RelayEvent};

pub const NONCE_TAG: &str = "nonce";

/// Leading zero bits of a hex id. Stops at the first non-zero (or non-hex) digit.
pub fn calculate_difficulty(hex_id: &str) -> u32 {
    let mut bits = 0;
    for c in hex_id.chars() {
        match c.to_digit(16) {
            Some(0) => bits += 4,
            Some(nibble) => {
                bits += nibble.leading_zeros() - 28;
                break;
            }
            None => break,
        }
    }
    bits
}

/// Target the sender committed to in its nonce tag, if any.
pub fn committed_target(event: &RelayEvent) -> Option<u32> {
    event.tag(NONCE_TAG)?.get(2)?.parse().ok()
}

/// `minimum <= 0` always passes. Otherwise a nonce tag must be present and the id must
/// carry at least `minimum` leading zero bits.
pub fn validate_difficulty(event: &RelayEvent, minimum: i32) -> bool {
    if minimum <= 0 {
        return true;
    }
    if event.tag(NONCE_TAG).is_none() {
        return false;
    }
    calculate_difficulty(&event.id) >= minimum as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    Found { event: RelayEvent, difficulty: u32 },
    Exhausted { attempts: u64 },
}

/// Search nonces until the event id reaches `target` bits or `max_attempts` is spent.
/// Every attempt rewrites the nonce tag and recomputes the id before checking it.
/// The returned event is unsigned; sign it after mining.
pub fn mine(
    mut event: RelayEvent,
    target: u32,
    max_attempts: u64,
) -> Result<MiningOutcome, EventError> {
    event.tags.retain(|t| t.first().map(String::as_str) != Some(NONCE_TAG));
    event.tags.push(vec![NONCE_TAG.into(), "0".into(), target.to_string()]);
    let nonce_slot = event.tags.len() - 1;
    event.sig.clear();

    for nonce in 0..max_attempts {
        event.tags[nonce_slot][1] = nonce.to_string();
        event.refresh_id()?;
        let difficulty = calculate_difficulty(&event.id);
        if difficulty >= target {
            debug!(nonce, difficulty, "proof of work found");
            return Ok(MiningOutcome::Found { event, difficulty });
        }
    }
    Ok(MiningOutcome::Exhausted {
        attempts: max_attempts,
    })
}
