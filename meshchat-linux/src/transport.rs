//! Links: TCP listener (incoming), TCP client (outbound to discovered peers), hello exchange,
//! length-prefixed frames. Each link runs in its own task; the core is shared.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshchat_core::{Action, Delivery, MeshCore, PeerId, MAX_SUPPORTED_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// version + peer id
pub const HELLO_SIZE: usize = 1 + 8;
const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: usize = 64 * 1024;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type LinkSenders = HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>;

/// The core plus the live links it can write to.
pub struct Node {
    core: Arc<MeshCore>,
    links: Mutex<LinkSenders>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Node {
    pub fn new(core: Arc<MeshCore>, deliveries: mpsc::UnboundedSender<Delivery>) -> Arc<Self> {
        Arc::new(Self {
            core,
            links: Mutex::new(HashMap::new()),
            deliveries,
        })
    }

    pub fn core(&self) -> &MeshCore {
        &self.core
    }

    pub async fn is_linked(&self, peer: PeerId) -> bool {
        self.links.lock().await.contains_key(&peer)
    }

    pub async fn linked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.links.lock().await.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Carry out core actions: queue frames on links, hand deliveries to the app.
    pub async fn dispatch(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        let links = self.links.lock().await;
        for action in actions {
            match action {
                Action::Send { to, bytes } => match links.get(&to) {
                    Some(tx) => {
                        let _ = tx.send(bytes);
                    }
                    None => debug!(peer = %to, "no link for outbound frame"),
                },
                Action::Broadcast { bytes, exclude } => {
                    for (peer, tx) in links.iter() {
                        if Some(*peer) != exclude {
                            let _ = tx.send(bytes.clone());
                        }
                    }
                }
                Action::Deliver(d) => {
                    let _ = self.deliveries.send(d);
                }
            }
        }
    }
}

/// Listen for incoming links; dial peers pushed to `connect_rx`.
pub async fn run_transport(
    node: Arc<Node>,
    port: u16,
    mut connect_rx: mpsc::UnboundedReceiver<(PeerId, SocketAddr)>,
) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "transport listening");

    let accept_node = node.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let node = accept_node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_link(stream, node).await {
                            debug!(%addr, error = %e, "inbound link ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    });

    while let Some((peer, addr)) = connect_rx.recv().await {
        if node.is_linked(peer).await {
            continue;
        }
        let node = node.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = serve_link(stream, node).await {
                        debug!(peer = %peer, error = %e, "outbound link ended");
                    }
                }
                Err(e) => debug!(peer = %peer, %addr, error = %e, "dial failed"),
            }
        });
    }
    Ok(())
}

/// Drive the core's timers once a second.
pub async fn run_ticker(node: Arc<Node>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        let actions = node.core.tick();
        node.dispatch(actions).await;
    }
}

pub fn hello_bytes(peer: PeerId) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = MAX_SUPPORTED_VERSION;
    out[1..].copy_from_slice(peer.as_bytes());
    out
}

pub fn parse_hello(buf: &[u8; HELLO_SIZE]) -> io::Result<PeerId> {
    if buf[0] == 0 || buf[0] > MAX_SUPPORTED_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    Ok(PeerId::from_slice(&buf[1..]))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Run one link until it closes: hello exchange, register with the node, then feed every
/// inbound frame to the core. A clean EOF is not an error.
pub async fn serve_link<S>(stream: S, node: Arc<Node>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let local = node.core.peer_id();
    let (mut reader, mut writer) = tokio::io::split(stream);
    writer.write_all(&hello_bytes(local)).await?;
    writer.flush().await?;
    let mut hello = [0u8; HELLO_SIZE];
    reader.read_exact(&mut hello).await?;
    let peer = parse_hello(&hello)?;
    if peer == local {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "link to self"));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut links = node.links.lock().await;
        if links.contains_key(&peer) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "duplicate link"));
        }
        links.insert(peer, tx);
    }
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "link write failed");
                break;
            }
        }
    });
    node.dispatch(node.core.on_link_established(peer)).await;

    let ended = loop {
        match read_frame(&mut reader).await {
            Ok(frame) => match node.core.on_packet_received(peer, &frame) {
                Ok(actions) => node.dispatch(actions).await,
                Err(e) => debug!(peer = %peer, error = %e, "frame dropped"),
            },
            Err(e) => break e,
        }
    };

    node.links.lock().await.remove(&peer);
    writer_task.abort();
    node.dispatch(node.core.on_link_lost(peer)).await;
    if ended.kind() == io::ErrorKind::UnexpectedEof {
        Ok(())
    } else {
        Err(ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshchat_core::{Config, Identity};

    fn node() -> (Arc<Node>, mpsc::UnboundedReceiver<Delivery>) {
        let core = Arc::new(MeshCore::new(Identity::generate(), "test", Config::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (Node::new(core, tx), rx)
    }

    #[tokio::test]
    async fn frames_roundtrip_and_cap() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, &[]).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"first");
        assert!(read_frame(&mut b).await.unwrap().is_empty());

        assert!(write_frame(&mut a, &vec![0u8; MAX_FRAME_LEN + 1]).await.is_err());
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn hello_versions() {
        let id = PeerId::new([4; 8]);
        let mut hello = hello_bytes(id);
        assert_eq!(parse_hello(&hello).unwrap(), id);
        hello[0] = 0;
        assert!(parse_hello(&hello).is_err());
        hello[0] = MAX_SUPPORTED_VERSION + 1;
        assert!(parse_hello(&hello).is_err());
    }

    #[tokio::test]
    async fn linked_nodes_exchange_messages() {
        let (a, mut a_rx) = node();
        let (b, mut b_rx) = node();
        let (sa, sb) = tokio::io::duplex(1 << 16);
        tokio::spawn(serve_link(sa, a.clone()));
        tokio::spawn(serve_link(sb, b.clone()));

        let a_id = a.core().peer_id();
        let announced = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(d) = b_rx.recv().await {
                if matches!(d, Delivery::PeerAnnounced { peer, .. } if peer == a_id) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(announced);
        assert_eq!(b.linked_peers().await, vec![a_id]);

        b.dispatch(b.core().send_public_message("over tcp").unwrap())
            .await;
        let text = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(d) = a_rx.recv().await {
                if let Delivery::PublicMessage { text, .. } = d {
                    return Some(text);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(text.as_deref(), Some("over tcp"));
    }

    #[tokio::test]
    async fn self_link_rejected() {
        let (a, _rx) = node();
        let (sa, sb) = tokio::io::duplex(64);
        let a2 = a.clone();
        let one = tokio::spawn(serve_link(sa, a));
        let two = tokio::spawn(serve_link(sb, a2));
        assert!(one.await.unwrap().is_err());
        assert!(two.await.unwrap().is_err());
    }
}
