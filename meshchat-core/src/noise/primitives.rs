//! The three Noise primitives as traits, with the 25519 / ChaChaPoly / SHA256 suite.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{CipherError, HandshakeError};

pub const DH_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Diffie-Hellman keypair.
pub trait Dh: Send + Sized {
    fn generate() -> Self;
    fn from_private(private: &[u8; DH_LEN]) -> Self;
    fn public_key(&self) -> [u8; DH_LEN];
    /// Fails on a non-contributory (low-order) remote key.
    fn dh(&self, remote_public: &[u8; DH_LEN]) -> Result<Zeroizing<[u8; DH_LEN]>, HandshakeError>;
}

/// AEAD cipher keyed once; nonces are supplied by the caller.
pub trait Cipher: Send + Sized {
    fn new(key: &[u8; KEY_LEN]) -> Self;
    fn encrypt(&self, nonce: u64, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, nonce: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
    /// Independent cipher holding the same key.
    fn fork(&self) -> Self;
}

/// Incremental hash plus the HKDF Noise derives from it.
pub trait NoiseHash: Send + Sized {
    fn new() -> Self;
    fn reset(&mut self);
    fn update(&mut self, data: &[u8]);
    /// Finalize and reset.
    fn digest(&mut self) -> [u8; HASH_LEN];
    fn fork(&self) -> Self;
    /// Noise `HKDF(chaining_key, ikm, 2)`.
    fn hkdf(
        chaining_key: &[u8; HASH_LEN],
        ikm: &[u8],
    ) -> (Zeroizing<[u8; HASH_LEN]>, Zeroizing<[u8; HASH_LEN]>);

    fn hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
        let mut h = Self::new();
        for p in parts {
            h.update(p);
        }
        h.digest()
    }
}

/// Curve25519 via x25519-dalek. The secret zeroizes itself on drop.
pub struct X25519 {
    secret: StaticSecret,
    public: [u8; DH_LEN],
}

impl Dh for X25519 {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    fn from_private(private: &[u8; DH_LEN]) -> Self {
        let secret = StaticSecret::from(*private);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    fn public_key(&self) -> [u8; DH_LEN] {
        self.public
    }

    fn dh(&self, remote_public: &[u8; DH_LEN]) -> Result<Zeroizing<[u8; DH_LEN]>, HandshakeError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*remote_public));
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakKey);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

/// ChaCha20-Poly1305. Nonce: 32 zero bits then the 64-bit counter little-endian.
pub struct ChaChaPoly {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ChaChaPoly {
    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    fn nonce(n: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&n.to_le_bytes());
        nonce
    }
}

impl Cipher for ChaChaPoly {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(*key),
        }
    }

    fn encrypt(&self, nonce: u64, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let n = Self::nonce(nonce);
        self.aead()
            .encrypt(Nonce::from_slice(&n), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CipherError::Encrypt)
    }

    fn decrypt(&self, nonce: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let n = Self::nonce(nonce);
        self.aead()
            .decrypt(Nonce::from_slice(&n), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CipherError::Decrypt)
    }

    fn fork(&self) -> Self {
        Self::new(&self.key)
    }
}

/// SHA-256; HKDF through the `hkdf` crate (RFC 5869 with empty info matches Noise's HKDF).
#[derive(Clone)]
pub struct Sha256Hash {
    inner: Sha256,
}

impl NoiseHash for Sha256Hash {
    fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    fn reset(&mut self) {
        self.inner = Sha256::new();
    }

    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.inner, data);
    }

    fn digest(&mut self) -> [u8; HASH_LEN] {
        self.inner.finalize_reset().into()
    }

    fn fork(&self) -> Self {
        self.clone()
    }

    fn hkdf(
        chaining_key: &[u8; HASH_LEN],
        ikm: &[u8],
    ) -> (Zeroizing<[u8; HASH_LEN]>, Zeroizing<[u8; HASH_LEN]>) {
        let kdf = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
        let mut okm = Zeroizing::new([0u8; 2 * HASH_LEN]);
        // 64 bytes is far below the 255 * 32 limit.
        kdf.expand(&[], &mut okm[..])
            .unwrap_or_else(|_| unreachable!("64-byte HKDF output is always valid"));
        let mut first = Zeroizing::new([0u8; HASH_LEN]);
        let mut second = Zeroizing::new([0u8; HASH_LEN]);
        first.copy_from_slice(&okm[..HASH_LEN]);
        second.copy_from_slice(&okm[HASH_LEN..]);
        (first, second)
    }
}
