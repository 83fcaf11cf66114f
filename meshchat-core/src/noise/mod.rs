//! Noise_XX_25519_ChaChaPoly_SHA256 sessions.

pub mod handshake;
pub mod primitives;
pub mod session;
pub mod state;

pub use handshake::{HandshakeState, HandshakeStatus, Role, TransportState, PROTOCOL_NAME};
pub use primitives::{ChaChaPoly, Cipher, Dh, NoiseHash, Sha256Hash, X25519};
pub use session::{HandshakeOutcome, SessionManager, SessionPhase};

/// The suite every session uses.
pub type XxHandshake = HandshakeState<X25519, ChaChaPoly, Sha256Hash>;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("nonce space exhausted")]
    NonceExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("remote key is low order")]
    WeakKey,
    #[error("handshake message failed authentication")]
    Authentication,
    #[error("handshake message has wrong size ({0} bytes)")]
    MessageSize(usize),
    #[error("handshake message out of turn")]
    OutOfTurn,
    #[error("handshake already failed")]
    Failed,
    #[error("handshake already complete")]
    AlreadyComplete,
    #[error("handshake not complete")]
    NotComplete,
    #[error("key required by pattern is missing")]
    MissingKey,
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("no session with peer")]
    NoSession,
    #[error("session not established")]
    NotEstablished,
    #[error("transport encryption failed")]
    Encrypt,
    #[error("transport decryption failed")]
    Decrypt,
    #[error("remote static key does not match peer id")]
    IdentityMismatch,
}
