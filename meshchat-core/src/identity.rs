//! Peer identity: 8-byte peer IDs, static Noise keypair, Ed25519 signing key, fingerprints.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a peer identifier on the wire.
pub const PEER_ID_LEN: usize = 8;

/// Peer ID: first 8 bytes of SHA-256 over the peer's static Noise public key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Reserved recipient meaning "everyone".
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_LEN]);

    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    /// Build an ID from up to 8 bytes, zero-padded on the right.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut id = [0u8; PEER_ID_LEN];
        let n = bytes.len().min(PEER_ID_LEN);
        id[..n].copy_from_slice(&bytes[..n]);
        PeerId(id)
    }

    /// Derive the peer ID for a static Noise public key.
    pub fn from_public_key(noise_public: &[u8; 32]) -> Self {
        let digest = Sha256::digest(noise_public);
        Self::from_slice(&digest[..PEER_ID_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 16-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != PEER_ID_LEN {
            return None;
        }
        Some(Self::from_slice(&bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// Static X25519 keypair used for Noise handshakes.
#[derive(Clone)]
pub struct NoiseKeypair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl NoiseKeypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public)
    }
}

/// Ed25519 keypair used to sign packets.
#[derive(Clone)]
pub struct SigningKeypair {
    key: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature. Malformed keys verify as false.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}

/// Stable fingerprint for out-of-band verification: lowercase hex SHA-256 of the public key.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Local identity: the static Noise key plus the packet signing key.
#[derive(Clone)]
pub struct Identity {
    noise: NoiseKeypair,
    signing: SigningKeypair,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            noise: NoiseKeypair::generate(),
            signing: SigningKeypair::generate(),
        }
    }

    pub fn from_stored(stored: &StoredIdentity) -> Self {
        Self {
            noise: NoiseKeypair::from_secret_bytes(stored.noise_secret),
            signing: SigningKeypair::from_secret_bytes(&stored.signing_secret),
        }
    }

    /// Load from the store, or generate and persist a fresh identity.
    pub fn load_or_create(store: &dyn IdentityStore) -> Result<Self, IdentityError> {
        if let Some(stored) = store.load_static_keypair()? {
            return Ok(Self::from_stored(&stored));
        }
        let identity = Self::generate();
        store.save_static_keypair(&identity.to_stored())?;
        Ok(identity)
    }

    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            noise_secret: *self.noise.secret_bytes(),
            signing_secret: *self.signing.secret_bytes(),
        }
    }

    pub fn noise(&self) -> &NoiseKeypair {
        &self.noise
    }

    pub fn signing(&self) -> &SigningKeypair {
        &self.signing
    }

    pub fn peer_id(&self) -> PeerId {
        self.noise.peer_id()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.noise.public_key())
    }
}

/// Secret key material as handed to and from an [`IdentityStore`]. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    pub noise_secret: [u8; 32],
    pub signing_secret: [u8; 32],
}

impl StoredIdentity {
    pub fn to_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(&self.noise_secret);
        out[32..].copy_from_slice(&self.signing_secret);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 64 {
            return None;
        }
        let mut stored = StoredIdentity {
            noise_secret: [0u8; 32],
            signing_secret: [0u8; 32],
        };
        stored.noise_secret.copy_from_slice(&bytes[..32]);
        stored.signing_secret.copy_from_slice(&bytes[32..]);
        Some(stored)
    }
}

/// Persistent key storage, owned by the host platform.
pub trait IdentityStore: Send + Sync {
    fn load_static_keypair(&self) -> Result<Option<StoredIdentity>, IdentityError>;
    fn save_static_keypair(&self, identity: &StoredIdentity) -> Result<(), IdentityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity store failure: {0}")]
    Store(String),
    #[error("stored identity is corrupt")]
    Corrupt,
}

/// Process-local store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<StoredIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load_static_keypair(&self) -> Result<Option<StoredIdentity>, IdentityError> {
        Ok(self.slot.lock().clone())
    }

    fn save_static_keypair(&self, identity: &StoredIdentity) -> Result<(), IdentityError> {
        *self.slot.lock() = Some(identity.clone());
        Ok(())
    }
}
