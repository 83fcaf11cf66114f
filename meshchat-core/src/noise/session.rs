//! Per-peer Noise sessions: handshake progression, transport ciphers, failure accounting.
//!
//! The session map is locked only to look a session up. An established session's two
//! directional ciphers sit behind their own locks, so sending to and receiving from the
//! same peer never contend.
//!
//! A handshake started by the remote side while a session is established runs next to it:
//! the old session keeps carrying traffic until the new one completes, and survives if the
//! new one fails or times out. The initiator's first message is unauthenticated, so it
//! must not be able to tear down a working session on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::handshake::Role;
use super::primitives::{ChaChaPoly, Dh, X25519, DH_LEN, HASH_LEN};
use super::state::CipherState;
use super::{HandshakeError, SessionError, XxHandshake};
use crate::identity::{NoiseKeypair, PeerId};

/// First XX message is exactly one ephemeral key.
const FIRST_MESSAGE_LEN: usize = DH_LEN;

pub const DEFAULT_DECRYPT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Handshaking,
    Established,
    Failed,
}

/// What handling one inbound handshake message produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Next handshake message to send back, if any.
    pub reply: Option<Vec<u8>>,
    /// Set when this message completed the handshake: the peer's verified static key.
    pub established: Option<[u8; DH_LEN]>,
}

struct Transport {
    send: Mutex<CipherState<ChaChaPoly>>,
    receive: Mutex<CipherState<ChaChaPoly>>,
    remote_static: [u8; DH_LEN],
    handshake_hash: [u8; HASH_LEN],
    decrypt_failures: AtomicU32,
}

struct Negotiation {
    handshake: XxHandshake,
    started: Instant,
    /// Session kept in service until this handshake replaces it.
    previous: Option<Arc<Transport>>,
}

impl Negotiation {
    fn new(handshake: XxHandshake, previous: Option<Arc<Transport>>) -> Box<Self> {
        Box::new(Self {
            handshake,
            started: Instant::now(),
            previous,
        })
    }
}

enum Session {
    Handshaking(Box<Negotiation>),
    Established(Arc<Transport>),
    Failed,
}

/// What a peer falls back to when a handshake is abandoned.
fn fallback(previous: Option<Arc<Transport>>) -> Session {
    previous.map_or(Session::Failed, Session::Established)
}

/// All Noise sessions of the local node, keyed by remote peer.
pub struct SessionManager {
    local: NoiseKeypair,
    local_peer: PeerId,
    sessions: Mutex<HashMap<PeerId, Session>>,
    failure_threshold: u32,
}

impl SessionManager {
    pub fn new(local: NoiseKeypair) -> Self {
        Self::with_failure_threshold(local, DEFAULT_DECRYPT_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(local: NoiseKeypair, failure_threshold: u32) -> Self {
        let local_peer = local.peer_id();
        Self {
            local,
            local_peer,
            sessions: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn new_handshake(&self, role: Role) -> XxHandshake {
        let static_key = X25519::from_private(&self.local.secret_bytes());
        XxHandshake::new(role, static_key, &[])
    }

    /// Start a fresh handshake as initiator, discarding any previous session with `peer`.
    /// Returns the first handshake message.
    pub fn initiate(&self, peer: PeerId) -> Result<Vec<u8>, SessionError> {
        let mut hs = self.new_handshake(Role::Initiator);
        let first = hs.write_message(&[])?;
        self.sessions
            .lock()
            .insert(peer, Session::Handshaking(Negotiation::new(hs, None)));
        debug!(peer = %peer, "noise handshake initiated");
        Ok(first)
    }

    /// Feed one inbound handshake message from `peer`.
    ///
    /// A first message opens a new responder handshake. An established session with
    /// `peer` stays in service until that handshake completes. When both sides initiated
    /// at once, the lower peer id keeps the initiator role and ignores the other side's
    /// first message.
    pub fn handle_handshake(
        &self,
        peer: PeerId,
        message: &[u8],
    ) -> Result<HandshakeOutcome, SessionError> {
        let mut sessions = self.sessions.lock();

        if message.len() == FIRST_MESSAGE_LEN {
            let previous = match sessions.get(&peer) {
                Some(Session::Handshaking(n))
                    if n.handshake.role() == Role::Initiator && self.local_peer < peer =>
                {
                    debug!(peer = %peer, "simultaneous handshake, keeping initiator role");
                    return Ok(HandshakeOutcome::default());
                }
                Some(Session::Handshaking(n)) => n.previous.clone(),
                Some(Session::Established(t)) => Some(Arc::clone(t)),
                Some(Session::Failed) | None => None,
            };
            let mut hs = self.new_handshake(Role::Responder);
            let step = hs.read_message(message).and_then(|_| hs.write_message(&[]));
            return match step {
                Ok(reply) => {
                    if previous.is_some() {
                        debug!(peer = %peer, "peer renegotiating, current session kept meanwhile");
                    }
                    sessions.insert(peer, Session::Handshaking(Negotiation::new(hs, previous)));
                    Ok(HandshakeOutcome {
                        reply: Some(reply),
                        established: None,
                    })
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "noise handshake failed");
                    sessions.insert(peer, fallback(previous));
                    Err(e.into())
                }
            };
        }

        let Some(Session::Handshaking(n)) = sessions.get_mut(&peer) else {
            debug!(peer = %peer, "handshake message with no handshake in progress");
            return Err(SessionError::NoSession);
        };
        let reply = match advance(&mut n.handshake, message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(peer = %peer, error = %e, "noise handshake failed");
                let previous = n.previous.take();
                sessions.insert(peer, fallback(previous));
                return Err(e.into());
            }
        };
        if !n.handshake.is_complete() {
            return Ok(HandshakeOutcome {
                reply,
                established: None,
            });
        }

        let Some(Session::Handshaking(n)) = sessions.remove(&peer) else {
            return Err(SessionError::NoSession);
        };
        let Negotiation {
            handshake,
            previous,
            ..
        } = *n;
        let transport = match handshake.into_transport() {
            Ok(t) => t,
            Err(e) => {
                sessions.insert(peer, fallback(previous));
                return Err(e.into());
            }
        };
        if PeerId::from_public_key(&transport.remote_static) != peer {
            warn!(peer = %peer, "remote static key does not match peer id");
            sessions.insert(peer, fallback(previous));
            return Err(SessionError::IdentityMismatch);
        }
        let remote_static = transport.remote_static;
        sessions.insert(
            peer,
            Session::Established(Arc::new(Transport {
                send: Mutex::new(transport.send),
                receive: Mutex::new(transport.receive),
                remote_static,
                handshake_hash: transport.handshake_hash,
                decrypt_failures: AtomicU32::new(0),
            })),
        );
        info!(peer = %peer, "noise session established");
        Ok(HandshakeOutcome {
            reply,
            established: Some(remote_static),
        })
    }

    /// The transport in service: the established one, or the one a renegotiation keeps.
    fn transport(&self, peer: PeerId) -> Result<Arc<Transport>, SessionError> {
        match self.sessions.lock().get(&peer) {
            Some(Session::Established(t)) => Ok(Arc::clone(t)),
            Some(Session::Handshaking(n)) => n.previous.clone().ok_or(SessionError::NotEstablished),
            Some(Session::Failed) => Err(SessionError::NotEstablished),
            None => Err(SessionError::NoSession),
        }
    }

    pub fn encrypt(&self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let transport = self.transport(peer)?;
        let mut send = transport.send.lock();
        send.encrypt_with_ad(&[], plaintext)
            .map_err(|_| SessionError::Encrypt)
    }

    /// Decrypt one transport message. Failures are counted per peer; a success resets
    /// the count.
    pub fn decrypt(&self, peer: PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let transport = self.transport(peer)?;
        let result = transport.receive.lock().decrypt_with_ad(&[], ciphertext);
        match result {
            Ok(plain) => {
                transport.decrypt_failures.store(0, Ordering::Relaxed);
                Ok(plain)
            }
            Err(_) => {
                let n = transport.decrypt_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if n >= self.failure_threshold {
                    warn!(peer = %peer, failures = n, "repeated decrypt failures");
                } else {
                    debug!(peer = %peer, failures = n, "decrypt failed");
                }
                Err(SessionError::Decrypt)
            }
        }
    }

    pub fn decrypt_failures(&self, peer: PeerId) -> u32 {
        self.transport(peer)
            .map(|t| t.decrypt_failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// True once consecutive decrypt failures reach the threshold.
    pub fn needs_rehandshake(&self, peer: PeerId) -> bool {
        self.decrypt_failures(peer) >= self.failure_threshold
    }

    /// Peers whose sessions should be torn down and renegotiated.
    pub fn peers_needing_rehandshake(&self) -> Vec<PeerId> {
        self.sessions
            .lock()
            .iter()
            .filter_map(|(peer, s)| match s {
                Session::Established(t)
                    if t.decrypt_failures.load(Ordering::Relaxed) >= self.failure_threshold =>
                {
                    Some(*peer)
                }
                _ => None,
            })
            .collect()
    }

    /// Abandon handshakes older than `timeout`. A renegotiation falls back to the session
    /// it was replacing; any other handshake is marked failed and its peer returned.
    pub fn expire_handshakes(&self, timeout: Duration) -> Vec<PeerId> {
        self.expire_handshakes_at(Instant::now(), timeout)
    }

    pub fn expire_handshakes_at(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<PeerId> = sessions
            .iter()
            .filter_map(|(peer, s)| match s {
                Session::Handshaking(n) if now.saturating_duration_since(n.started) >= timeout => {
                    Some(*peer)
                }
                _ => None,
            })
            .collect();

        let mut abandoned = Vec::new();
        for peer in expired {
            let Some(Session::Handshaking(n)) = sessions.remove(&peer) else {
                continue;
            };
            match n.previous {
                Some(t) => {
                    debug!(peer = %peer, "renegotiation timed out, keeping current session");
                    sessions.insert(peer, Session::Established(t));
                }
                None => {
                    debug!(peer = %peer, "noise handshake timed out");
                    sessions.insert(peer, Session::Failed);
                    abandoned.push(peer);
                }
            }
        }
        abandoned
    }

    /// A peer renegotiating over a live session still reports `Established`.
    pub fn phase(&self, peer: PeerId) -> SessionPhase {
        match self.sessions.lock().get(&peer) {
            None => SessionPhase::Uninitialized,
            Some(Session::Handshaking(n)) if n.previous.is_some() => SessionPhase::Established,
            Some(Session::Handshaking(_)) => SessionPhase::Handshaking,
            Some(Session::Established(_)) => SessionPhase::Established,
            Some(Session::Failed) => SessionPhase::Failed,
        }
    }

    pub fn is_established(&self, peer: PeerId) -> bool {
        self.phase(peer) == SessionPhase::Established
    }

    pub fn remote_static_key(&self, peer: PeerId) -> Option<[u8; DH_LEN]> {
        self.transport(peer).ok().map(|t| t.remote_static)
    }

    pub fn handshake_hash(&self, peer: PeerId) -> Option<[u8; HASH_LEN]> {
        self.transport(peer).ok().map(|t| t.handshake_hash)
    }

    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, s)| match s {
                Session::Established(_) => true,
                Session::Handshaking(n) => n.previous.is_some(),
                Session::Failed => false,
            })
            .map(|(p, _)| *p)
            .collect()
    }

    /// Tear down the session. Key material is zeroed when the last reference drops.
    pub fn remove(&self, peer: PeerId) -> bool {
        let removed = self.sessions.lock().remove(&peer).is_some();
        if removed {
            debug!(peer = %peer, "noise session removed");
        }
        removed
    }
}

/// Read one message and, if it is then our turn, write the next one.
fn advance(hs: &mut XxHandshake, message: &[u8]) -> Result<Option<Vec<u8>>, HandshakeError> {
    hs.read_message(message)?;
    if hs.is_my_turn() {
        Ok(Some(hs.write_message(&[])?))
    } else {
        Ok(None)
    }
}
