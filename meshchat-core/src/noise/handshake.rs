//! XX handshake state machine.
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```

use zeroize::Zeroizing;

use super::primitives::{Cipher, Dh, NoiseHash, DH_LEN, HASH_LEN, TAG_LEN};
use super::state::{CipherState, SymmetricState};
use super::HandshakeError;

pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Noise messages are capped at 65535 bytes.
pub const MAX_MESSAGE_LEN: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    E,
    S,
    Ee,
    Es,
    Se,
}

const XX_MESSAGES: [&[Token]; 3] = [
    &[Token::E],
    &[Token::E, Token::Ee, Token::S, Token::Es],
    &[Token::S, Token::Se],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    InProgress,
    Complete,
    Failed,
}

/// Directional transport ciphers derived by split, plus what the handshake authenticated.
pub struct TransportState<C: Cipher> {
    pub send: CipherState<C>,
    pub receive: CipherState<C>,
    pub remote_static: [u8; DH_LEN],
    pub handshake_hash: [u8; HASH_LEN],
}

pub struct HandshakeState<D: Dh, C: Cipher, H: NoiseHash> {
    role: Role,
    symmetric: SymmetricState<C, H>,
    local_static: D,
    local_ephemeral: Option<D>,
    remote_static: Option<[u8; DH_LEN]>,
    remote_ephemeral: Option<[u8; DH_LEN]>,
    message_index: usize,
    status: HandshakeStatus,
}

impl<D: Dh, C: Cipher, H: NoiseHash> HandshakeState<D, C, H> {
    pub fn new(role: Role, local_static: D, prologue: &[u8]) -> Self {
        let mut symmetric = SymmetricState::initialize(PROTOCOL_NAME);
        symmetric.mix_hash(prologue);
        Self {
            role,
            symmetric,
            local_static,
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            message_index: 0,
            status: HandshakeStatus::InProgress,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> HandshakeStatus {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        self.status == HandshakeStatus::Complete
    }

    /// Initiator writes messages 0 and 2, responder writes message 1.
    pub fn is_my_turn(&self) -> bool {
        self.status == HandshakeStatus::InProgress
            && match self.role {
                Role::Initiator => self.message_index % 2 == 0,
                Role::Responder => self.message_index % 2 == 1,
            }
    }

    pub fn remote_static(&self) -> Option<&[u8; DH_LEN]> {
        self.remote_static.as_ref()
    }

    /// Write the next handshake message. Writing out of turn fails the handshake.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.check_usable()?;
        if !self.is_my_turn() {
            self.status = HandshakeStatus::Failed;
            return Err(HandshakeError::OutOfTurn);
        }
        let result = self.write_tokens(payload);
        self.finish_step(result)
    }

    /// Read the peer's next handshake message and return its payload. Any failure is final.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.check_usable()?;
        if self.is_my_turn() {
            self.status = HandshakeStatus::Failed;
            return Err(HandshakeError::OutOfTurn);
        }
        if message.len() > MAX_MESSAGE_LEN {
            self.status = HandshakeStatus::Failed;
            return Err(HandshakeError::MessageSize(message.len()));
        }
        let result = self.read_tokens(message);
        self.finish_step(result)
    }

    /// Split into transport ciphers. Consumes the handshake; ephemeral keys drop here.
    pub fn into_transport(self) -> Result<TransportState<C>, HandshakeError> {
        if !self.is_complete() {
            return Err(HandshakeError::NotComplete);
        }
        let remote_static = self.remote_static.ok_or(HandshakeError::NotComplete)?;
        let (initiator_to_responder, responder_to_initiator) = self.symmetric.split();
        let (send, receive) = match self.role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };
        Ok(TransportState {
            send,
            receive,
            remote_static,
            handshake_hash: self.symmetric.handshake_hash(),
        })
    }

    fn check_usable(&self) -> Result<(), HandshakeError> {
        match self.status {
            HandshakeStatus::InProgress => Ok(()),
            HandshakeStatus::Complete => Err(HandshakeError::AlreadyComplete),
            HandshakeStatus::Failed => Err(HandshakeError::Failed),
        }
    }

    fn finish_step(
        &mut self,
        result: Result<Vec<u8>, HandshakeError>,
    ) -> Result<Vec<u8>, HandshakeError> {
        match result {
            Ok(out) => {
                self.message_index += 1;
                if self.message_index == XX_MESSAGES.len() {
                    self.status = HandshakeStatus::Complete;
                }
                Ok(out)
            }
            Err(e) => {
                self.status = HandshakeStatus::Failed;
                Err(e)
            }
        }
    }

    fn write_tokens(&mut self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let mut out = Vec::new();
        for &token in XX_MESSAGES[self.message_index] {
            match token {
                Token::E => {
                    let e = D::generate();
                    let public = e.public_key();
                    out.extend_from_slice(&public);
                    self.symmetric.mix_hash(&public);
                    self.local_ephemeral = Some(e);
                }
                Token::S => {
                    let public = self.local_static.public_key();
                    let ct = self.symmetric.encrypt_and_hash(&public)?;
                    out.extend_from_slice(&ct);
                }
                dh_token => self.mix_dh(dh_token)?,
            }
        }
        let ct = self.symmetric.encrypt_and_hash(payload)?;
        out.extend_from_slice(&ct);
        if out.len() > MAX_MESSAGE_LEN {
            return Err(HandshakeError::MessageSize(out.len()));
        }
        Ok(out)
    }

    fn read_tokens(&mut self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let mut rest = message;
        for &token in XX_MESSAGES[self.message_index] {
            match token {
                Token::E => {
                    let (key, tail) = split_key(rest, DH_LEN, message.len())?;
                    let mut re = [0u8; DH_LEN];
                    re.copy_from_slice(key);
                    self.symmetric.mix_hash(&re);
                    self.remote_ephemeral = Some(re);
                    rest = tail;
                }
                Token::S => {
                    let len = DH_LEN + if self.symmetric.has_key() { TAG_LEN } else { 0 };
                    let (ct, tail) = split_key(rest, len, message.len())?;
                    let plain = self.symmetric.decrypt_and_hash(ct)?;
                    let mut rs = [0u8; DH_LEN];
                    rs.copy_from_slice(&plain);
                    self.remote_static = Some(rs);
                    rest = tail;
                }
                dh_token => self.mix_dh(dh_token)?,
            }
        }
        if self.symmetric.has_key() && rest.len() < TAG_LEN {
            return Err(HandshakeError::MessageSize(message.len()));
        }
        self.symmetric.decrypt_and_hash(rest)
    }

    fn mix_dh(&mut self, token: Token) -> Result<(), HandshakeError> {
        let shared = self.dh_for(token)?;
        self.symmetric.mix_key(&shared[..]);
        Ok(())
    }

    fn dh_for(&self, token: Token) -> Result<Zeroizing<[u8; DH_LEN]>, HandshakeError> {
        let e = self.local_ephemeral.as_ref().ok_or(HandshakeError::MissingKey)?;
        let s = &self.local_static;
        let re = self.remote_ephemeral.as_ref().ok_or(HandshakeError::MissingKey);
        let rs = self.remote_static.as_ref().ok_or(HandshakeError::MissingKey);
        // es: initiator's ephemeral with responder's static; se: the reverse.
        match (token, self.role) {
            (Token::Ee, _) => e.dh(re?),
            (Token::Es, Role::Initiator) => e.dh(rs?),
            (Token::Es, Role::Responder) => s.dh(re?),
            (Token::Se, Role::Initiator) => s.dh(re?),
            (Token::Se, Role::Responder) => e.dh(rs?),
            (Token::E | Token::S, _) => Err(HandshakeError::MissingKey),
        }
    }
}

fn split_key(buf: &[u8], len: usize, total: usize) -> Result<(&[u8], &[u8]), HandshakeError> {
    if buf.len() < len {
        return Err(HandshakeError::MessageSize(total));
    }
    Ok(buf.split_at(len))
}

#[cfg(test)]
mod tests {
    use super::super::primitives::{ChaChaPoly, Sha256Hash, X25519};
    use super::*;

    type Xx = HandshakeState<X25519, ChaChaPoly, Sha256Hash>;

    fn pair() -> (Xx, Xx, [u8; 32], [u8; 32]) {
        let a = X25519::generate();
        let b = X25519::generate();
        let (a_pub, b_pub) = (a.public_key(), b.public_key());
        (
            Xx::new(Role::Initiator, a, b"prologue"),
            Xx::new(Role::Responder, b, b"prologue"),
            a_pub,
            b_pub,
        )
    }

    #[test]
    fn full_handshake_and_transport() {
        let (mut init, mut resp, init_pub, resp_pub) = pair();
        let m1 = init.write_message(b"").unwrap();
        assert_eq!(m1.len(), 32);
        resp.read_message(&m1).unwrap();
        let m2 = resp.write_message(b"").unwrap();
        assert_eq!(m2.len(), 32 + 48 + 16);
        init.read_message(&m2).unwrap();
        let m3 = init.write_message(b"").unwrap();
        assert_eq!(m3.len(), 48 + 16);
        resp.read_message(&m3).unwrap();

        assert!(init.is_complete() && resp.is_complete());
        assert_eq!(init.remote_static(), Some(&resp_pub));
        assert_eq!(resp.remote_static(), Some(&init_pub));

        let mut a = init.into_transport().unwrap();
        let mut b = resp.into_transport().unwrap();
        assert_eq!(a.handshake_hash, b.handshake_hash);
        let ct = a.send.encrypt_with_ad(&[], b"ping").unwrap();
        assert_eq!(b.receive.decrypt_with_ad(&[], &ct).unwrap(), b"ping");
        let ct = b.send.encrypt_with_ad(&[], b"pong").unwrap();
        assert_eq!(a.receive.decrypt_with_ad(&[], &ct).unwrap(), b"pong");
    }

    #[test]
    fn payloads_are_carried() {
        let (mut init, mut resp, _, _) = pair();
        let m1 = init.write_message(b"hello").unwrap();
        assert_eq!(resp.read_message(&m1).unwrap(), b"hello");
        let m2 = resp.write_message(b"secret-2").unwrap();
        assert_eq!(init.read_message(&m2).unwrap(), b"secret-2");
    }

    #[test]
    fn out_of_turn_write_fails_loudly() {
        let (_, mut resp, _, _) = pair();
        assert!(matches!(
            resp.write_message(b""),
            Err(HandshakeError::OutOfTurn)
        ));
        assert_eq!(resp.status(), HandshakeStatus::Failed);
        assert!(matches!(resp.read_message(&[0u8; 32]), Err(HandshakeError::Failed)));
    }

    #[test]
    fn out_of_turn_read_fails() {
        let (mut init, _, _, _) = pair();
        assert!(matches!(
            init.read_message(&[0u8; 32]),
            Err(HandshakeError::OutOfTurn)
        ));
    }

    #[test]
    fn tampered_message_two_fails_session() {
        let (mut init, mut resp, _, _) = pair();
        let m1 = init.write_message(b"").unwrap();
        resp.read_message(&m1).unwrap();
        let mut m2 = resp.write_message(b"").unwrap();
        m2[40] ^= 0x01;
        assert!(matches!(
            init.read_message(&m2),
            Err(HandshakeError::Authentication)
        ));
        assert_eq!(init.status(), HandshakeStatus::Failed);
        assert!(init.into_transport().is_err());
    }

    #[test]
    fn short_message_rejected() {
        let (mut init, mut resp, _, _) = pair();
        let m1 = init.write_message(b"").unwrap();
        assert!(matches!(
            resp.read_message(&m1[..20]),
            Err(HandshakeError::MessageSize(20))
        ));
        assert_eq!(resp.status(), HandshakeStatus::Failed);
    }

    #[test]
    fn split_before_completion_rejected() {
        let (mut init, _, _, _) = pair();
        init.write_message(b"").unwrap();
        assert!(matches!(
            init.into_transport(),
            Err(HandshakeError::NotComplete)
        ));
    }
}
