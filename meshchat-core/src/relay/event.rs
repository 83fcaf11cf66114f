//! Relay events: canonical id, Schnorr signatures, channel-scoped keys.

use hkdf::Hkdf;
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Ephemeral geotagged chat post.
pub const KIND_GEOHASH_CHAT: u32 = 20000;

const GEOHASH_KEY_SALT: &[u8] = b"meshchat-geohash-identity";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RelayEvent {
    /// Unsigned event with its id already computed.
    pub fn new(
        pubkey: String,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Self, EventError> {
        let mut event = Self {
            id: String::new(),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        };
        event.refresh_id()?;
        Ok(event)
    }

    /// SHA-256 over `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
    pub fn compute_id(&self) -> Result<String, EventError> {
        let canonical = serde_json::to_vec(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    pub fn refresh_id(&mut self) -> Result<(), EventError> {
        self.id = self.compute_id()?;
        Ok(())
    }

    pub fn verify_id(&self) -> bool {
        self.compute_id().is_ok_and(|id| id == self.id)
    }

    pub fn sign(mut self, keys: &RelayKeypair) -> Result<Self, EventError> {
        self.pubkey = keys.public_key_hex();
        self.refresh_id()?;
        self.sig = keys.sign_id(&self.id)?;
        Ok(self)
    }

    pub fn verify_signature(&self) -> bool {
        let verify = || -> Result<(), EventError> {
            let msg = id_message(&self.id)?;
            let pubkey_bytes = hex::decode(&self.pubkey).map_err(|_| EventError::InvalidKey)?;
            let pubkey =
                XOnlyPublicKey::from_slice(&pubkey_bytes).map_err(|_| EventError::InvalidKey)?;
            let sig_bytes = hex::decode(&self.sig).map_err(|_| EventError::InvalidSignature)?;
            let sig = Signature::from_slice(&sig_bytes).map_err(|_| EventError::InvalidSignature)?;
            SECP256K1
                .verify_schnorr(&sig, &msg, &pubkey)
                .map_err(|_| EventError::InvalidSignature)
        };
        verify().is_ok()
    }

    /// First tag named `name`, whole tuple.
    pub fn tag(&self, name: &str) -> Option<&[String]> {
        self.tags
            .iter()
            .find(|t| t.first().is_some_and(|n| n == name))
            .map(Vec::as_slice)
    }

    /// Second element of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tag(name).and_then(|t| t.get(1)).map(String::as_str)
    }

    pub fn has_tag(&self, name: &str, value: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.len() >= 2 && t[0] == name && t[1] == value)
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(s)?)
    }
}

fn id_message(id: &str) -> Result<Message, EventError> {
    let bytes = hex::decode(id).map_err(|_| EventError::InvalidId)?;
    let digest: [u8; 32] = bytes.try_into().map_err(|_| EventError::InvalidId)?;
    Ok(Message::from_digest(digest))
}

/// secp256k1 keypair for relay identities. Public keys are x-only, hex encoded.
pub struct RelayKeypair {
    keypair: Keypair,
}

impl RelayKeypair {
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::new(SECP256K1, &mut rand::thread_rng()),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, EventError> {
        let keypair =
            Keypair::from_seckey_slice(SECP256K1, secret).map_err(|_| EventError::InvalidKey)?;
        Ok(Self { keypair })
    }

    /// Deterministic per-channel key: the same seed and geohash always give the same key,
    /// and different geohashes give unlinkable keys.
    pub fn derive_for_geohash(seed: &[u8], geohash: &str) -> Result<Self, EventError> {
        let kdf = Hkdf::<Sha256>::new(Some(GEOHASH_KEY_SALT), seed);
        for counter in 0u8..=u8::MAX {
            let mut info = geohash.to_ascii_lowercase().into_bytes();
            info.push(counter);
            let mut secret = Zeroizing::new([0u8; 32]);
            kdf.expand(&info, &mut secret[..])
                .map_err(|_| EventError::InvalidKey)?;
            if let Ok(keys) = Self::from_secret_bytes(&secret) {
                return Ok(keys);
            }
        }
        Err(EventError::InvalidKey)
    }

    pub fn public_key_hex(&self) -> String {
        let (xonly, _parity) = self.keypair.x_only_public_key();
        hex::encode(xonly.serialize())
    }

    fn sign_id(&self, id: &str) -> Result<String, EventError> {
        let msg = id_message(id)?;
        let sig = SECP256K1.sign_schnorr(&msg, &self.keypair);
        Ok(sig.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid event id")]
    InvalidId,
    #[error("invalid signature")]
    InvalidSignature,
}
