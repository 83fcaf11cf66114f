//! LAN discovery: UDP multicast beacons carrying the peer id and link port.
//!
//! Only the side with the lower peer id dials, so two daemons that see each other end up
//! with a single link.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshchat_core::{PeerId, MAX_SUPPORTED_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);
const BEACON_MAGIC: &[u8; 4] = b"MSHC";

pub const BEACON_SIZE: usize = 4 + 1 + 8 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub version: u8,
    pub peer_id: PeerId,
    pub transport_port: u16,
}

impl Beacon {
    pub fn encode(&self) -> [u8; BEACON_SIZE] {
        let mut out = [0u8; BEACON_SIZE];
        out[..4].copy_from_slice(BEACON_MAGIC);
        out[4] = self.version;
        out[5..13].copy_from_slice(self.peer_id.as_bytes());
        out[13..].copy_from_slice(&self.transport_port.to_be_bytes());
        out
    }

    /// `None` for anything that isn't a beacon we can link with.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != BEACON_SIZE || &buf[..4] != BEACON_MAGIC {
            return None;
        }
        let version = buf[4];
        if version == 0 || version > MAX_SUPPORTED_VERSION {
            return None;
        }
        Some(Self {
            version,
            peer_id: PeerId::from_slice(&buf[5..13]),
            transport_port: u16::from_be_bytes([buf[13], buf[14]]),
        })
    }
}

/// Whether we are the side that dials `remote`.
pub fn should_dial(local: PeerId, remote: PeerId) -> bool {
    local < remote
}

pub async fn run_discovery(
    local: PeerId,
    discovery_port: u16,
    transport_port: u16,
    connect_tx: mpsc::UnboundedSender<(PeerId, SocketAddr)>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let beacon = Beacon {
        version: MAX_SUPPORTED_VERSION,
        peer_id: local,
        transport_port,
    }
    .encode();
    info!(port = discovery_port, "discovery running");

    let send_socket = socket.clone();
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    let beacon_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(BEACON_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = send_socket.send_to(&beacon, dest).await {
                debug!(error = %e, "beacon send failed");
            }
        }
    });

    let result = recv_loop(&socket, local, &beacon, connect_tx).await;
    beacon_task.abort();
    result
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(
    socket: &UdpSocket,
    local: PeerId,
    beacon: &[u8; BEACON_SIZE],
    connect_tx: mpsc::UnboundedSender<(PeerId, SocketAddr)>,
) -> std::io::Result<()> {
    let mut last_seen: HashMap<PeerId, Instant> = HashMap::new();
    let mut buf = [0u8; 64];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(remote) = Beacon::decode(&buf[..n]) else {
            continue;
        };
        if remote.peer_id == local {
            continue;
        }

        let now = Instant::now();
        last_seen.retain(|_, seen| now.duration_since(*seen) < PEER_TIMEOUT);
        if last_seen.insert(remote.peer_id, now).is_none() {
            info!(peer = %remote.peer_id, addr = %from.ip(), "peer discovered");
            // Answer directly so the newcomer doesn't wait a full beacon interval.
            let _ = socket.send_to(beacon, from).await;
        }
        if should_dial(local, remote.peer_id) {
            let addr = SocketAddr::new(from.ip(), remote.transport_port);
            if connect_tx.send((remote.peer_id, addr)).is_err() {
                return Ok(());
            }
        }
    }
}
