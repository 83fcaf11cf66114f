//! Announce payload: TLV-encoded nickname, keys and direct neighbours.
//!
//! Each entry is type (1) + length (1) + value. Unknown types are skipped.

use crate::identity::{PeerId, PEER_ID_LEN};

const TLV_NICKNAME: u8 = 0x01;
const TLV_NOISE_KEY: u8 = 0x02;
const TLV_SIGNING_KEY: u8 = 0x03;
const TLV_NEIGHBORS: u8 = 0x04;

/// A single TLV value holds at most 255 bytes, so at most 31 neighbours fit.
pub const MAX_ANNOUNCED_NEIGHBORS: usize = 255 / PEER_ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub nickname: String,
    pub noise_public_key: [u8; 32],
    pub signing_public_key: [u8; 32],
    /// `None` when the announcer did not report neighbours at all.
    pub neighbors: Option<Vec<PeerId>>,
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>, AnnounceError> {
        let nick = self.nickname.as_bytes();
        if nick.len() > u8::MAX as usize {
            return Err(AnnounceError::ValueTooLong(TLV_NICKNAME));
        }
        let mut out = Vec::with_capacity(2 + nick.len() + 68);
        push_tlv(&mut out, TLV_NICKNAME, nick);
        push_tlv(&mut out, TLV_NOISE_KEY, &self.noise_public_key);
        push_tlv(&mut out, TLV_SIGNING_KEY, &self.signing_public_key);
        if let Some(neighbors) = &self.neighbors {
            let take = neighbors.len().min(MAX_ANNOUNCED_NEIGHBORS);
            let bytes: Vec<u8> = neighbors[..take]
                .iter()
                .flat_map(|p| *p.as_bytes())
                .collect();
            push_tlv(&mut out, TLV_NEIGHBORS, &bytes);
        }
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, AnnounceError> {
        let mut nickname = None;
        let mut noise_public_key = None;
        let mut signing_public_key = None;
        let mut neighbors = None;

        let mut rest = payload;
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(AnnounceError::Truncated);
            }
            let (tag, len) = (rest[0], rest[1] as usize);
            let value = rest.get(2..2 + len).ok_or(AnnounceError::Truncated)?;
            rest = &rest[2 + len..];
            match tag {
                TLV_NICKNAME => {
                    let nick =
                        std::str::from_utf8(value).map_err(|_| AnnounceError::InvalidNickname)?;
                    nickname = Some(nick.to_string());
                }
                TLV_NOISE_KEY => noise_public_key = Some(key(value, tag)?),
                TLV_SIGNING_KEY => signing_public_key = Some(key(value, tag)?),
                TLV_NEIGHBORS => {
                    if value.len() % PEER_ID_LEN != 0 {
                        return Err(AnnounceError::BadLength(tag));
                    }
                    neighbors = Some(
                        value
                            .chunks_exact(PEER_ID_LEN)
                            .map(PeerId::from_slice)
                            .collect(),
                    );
                }
                _ => {}
            }
        }

        Ok(Self {
            nickname: nickname.ok_or(AnnounceError::Missing(TLV_NICKNAME))?,
            noise_public_key: noise_public_key.ok_or(AnnounceError::Missing(TLV_NOISE_KEY))?,
            signing_public_key: signing_public_key
                .ok_or(AnnounceError::Missing(TLV_SIGNING_KEY))?,
            neighbors,
        })
    }
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

fn key(value: &[u8], tag: u8) -> Result<[u8; 32], AnnounceError> {
    value.try_into().map_err(|_| AnnounceError::BadLength(tag))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnnounceError {
    #[error("announce payload truncated")]
    Truncated,
    #[error("TLV {0:#04x} has wrong length")]
    BadLength(u8),
    #[error("TLV {0:#04x} value too long")]
    ValueTooLong(u8),
    #[error("required TLV {0:#04x} missing")]
    Missing(u8),
    #[error("nickname is not UTF-8")]
    InvalidNickname,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(neighbors: Option<Vec<PeerId>>) -> Announcement {
        Announcement {
            nickname: "alice".into(),
            noise_public_key: [1; 32],
            signing_public_key: [2; 32],
            neighbors,
        }
    }

    #[test]
    fn neighbors_absent_vs_empty() {
        let none = sample(None);
        assert_eq!(Announcement::decode(&none.encode().unwrap()).unwrap(), none);
        let empty = sample(Some(vec![]));
        assert_eq!(
            Announcement::decode(&empty.encode().unwrap()).unwrap().neighbors,
            Some(vec![])
        );
        let two = sample(Some(vec![PeerId::new([3; 8]), PeerId::new([4; 8])]));
        assert_eq!(Announcement::decode(&two.encode().unwrap()).unwrap(), two);
    }

    #[test]
    fn unknown_tlv_skipped() {
        let mut bytes = sample(None).encode().unwrap();
        bytes.extend_from_slice(&[0x7F, 3, 9, 9, 9]);
        assert_eq!(Announcement::decode(&bytes).unwrap(), sample(None));
    }

    #[test]
    fn truncated_and_missing_rejected() {
        let bytes = sample(None).encode().unwrap();
        assert_eq!(
            Announcement::decode(&bytes[..bytes.len() - 1]),
            Err(AnnounceError::Truncated)
        );
        assert_eq!(
            Announcement::decode(&[TLV_NICKNAME, 1, b'x']),
            Err(AnnounceError::Missing(TLV_NOISE_KEY))
        );
        assert_eq!(
            Announcement::decode(&[TLV_NOISE_KEY, 2, 0, 0]),
            Err(AnnounceError::BadLength(TLV_NOISE_KEY))
        );
    }

    #[test]
    fn neighbor_list_capped() {
        let many: Vec<PeerId> = (0..40u8).map(|i| PeerId::new([i; 8])).collect();
        let decoded = Announcement::decode(&sample(Some(many)).encode().unwrap()).unwrap();
        assert_eq!(decoded.neighbors.unwrap().len(), MAX_ANNOUNCED_NEIGHBORS);
    }
}
