//! Noise CipherState and SymmetricState.

use zeroize::Zeroizing;

use super::primitives::{Cipher, NoiseHash, HASH_LEN, KEY_LEN};
use super::{CipherError, HandshakeError};

/// A cipher plus its nonce counter. Each nonce is used at most once per key.
pub struct CipherState<C: Cipher> {
    cipher: Option<C>,
    nonce: u64,
}

impl<C: Cipher> CipherState<C> {
    pub fn empty() -> Self {
        Self {
            cipher: None,
            nonce: 0,
        }
    }

    pub fn with_key(key: &[u8; KEY_LEN]) -> Self {
        let mut cs = Self::empty();
        cs.initialize_key(key);
        cs
    }

    pub fn initialize_key(&mut self, key: &[u8; KEY_LEN]) {
        self.cipher = Some(C::new(key));
        self.nonce = 0;
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Without a key the plaintext passes through, as the handshake's first message requires.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        // 2^64 - 1 is reserved.
        if self.nonce == u64::MAX {
            return Err(CipherError::NonceExhausted);
        }
        let out = cipher.encrypt(self.nonce, ad, plaintext)?;
        self.nonce += 1;
        Ok(out)
    }

    /// The counter only advances on successful authentication.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_vec());
        };
        if self.nonce == u64::MAX {
            return Err(CipherError::NonceExhausted);
        }
        let out = cipher.decrypt(self.nonce, ad, ciphertext)?;
        self.nonce += 1;
        Ok(out)
    }
}

/// Chaining key, handshake hash and the handshake's CipherState.
pub struct SymmetricState<C: Cipher, H: NoiseHash> {
    cipher_state: CipherState<C>,
    chaining_key: Zeroizing<[u8; HASH_LEN]>,
    hash: [u8; HASH_LEN],
    _hash: std::marker::PhantomData<H>,
}

impl<C: Cipher, H: NoiseHash> SymmetricState<C, H> {
    pub fn initialize(protocol_name: &[u8]) -> Self {
        let hash = if protocol_name.len() <= HASH_LEN {
            let mut h = [0u8; HASH_LEN];
            h[..protocol_name.len()].copy_from_slice(protocol_name);
            h
        } else {
            H::hash(&[protocol_name])
        };
        Self {
            cipher_state: CipherState::empty(),
            chaining_key: Zeroizing::new(hash),
            hash,
            _hash: std::marker::PhantomData,
        }
    }

    pub fn mix_key(&mut self, input_key_material: &[u8]) {
        let (ck, temp_k) = H::hkdf(&self.chaining_key, input_key_material);
        self.chaining_key = ck;
        self.cipher_state.initialize_key(&temp_k);
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = H::hash(&[&self.hash[..], data]);
    }

    pub fn has_key(&self) -> bool {
        self.cipher_state.has_key()
    }

    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let ciphertext = self.cipher_state.encrypt_with_ad(&self.hash, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let plaintext = self
            .cipher_state
            .decrypt_with_ad(&self.hash, ciphertext)
            .map_err(|_| HandshakeError::Authentication)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the two transport ciphers: (initiator -> responder, responder -> initiator).
    pub fn split(&self) -> (CipherState<C>, CipherState<C>) {
        let (k1, k2) = H::hkdf(&self.chaining_key, &[]);
        (CipherState::with_key(&k1), CipherState::with_key(&k2))
    }

    pub fn handshake_hash(&self) -> [u8; HASH_LEN] {
        self.hash
    }
}
