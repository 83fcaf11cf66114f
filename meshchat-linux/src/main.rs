// meshchat Linux daemon: discovery, links and a line console around one shared core.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use meshchat_core::{Identity, MeshCore};
use meshchat_linux::chat::{self, GeoChannel};
use meshchat_linux::transport::{self, Node};
use meshchat_linux::{config, console, discovery, store};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("meshchat-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let store = store::FileIdentityStore::new(cfg.identity_path());
    let identity = Identity::load_or_create(&store)
        .with_context(|| format!("loading identity from {}", store.path().display()))?;

    let geo = match &cfg.geohash {
        Some(geohash) => {
            let seed = identity.to_stored();
            let channel = GeoChannel::new(
                geohash,
                &seed.signing_secret,
                cfg.core.min_pow_difficulty,
                cfg.core.relay_dedup_capacity,
            )
            .context("deriving geohash channel key")?;
            info!(geohash = %channel.geohash(), pubkey = %channel.public_key_hex(), "following geohash channel");
            Some(Arc::new(channel))
        }
        None => None,
    };

    let core = Arc::new(MeshCore::new(identity, &cfg.nickname, cfg.core.clone()));
    info!(
        peer = %core.peer_id(),
        fingerprint = %core.fingerprint(),
        nickname = %cfg.nickname,
        "meshchat {} starting",
        VERSION
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, core, geo))
}

async fn run(
    cfg: config::Config,
    core: Arc<MeshCore>,
    geo: Option<Arc<GeoChannel>>,
) -> anyhow::Result<()> {
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    let (connect_tx, connect_rx) = mpsc::unbounded_channel();
    let node = Node::new(core.clone(), delivery_tx);

    let local = core.peer_id();
    let (discovery_port, transport_port) = (cfg.discovery_port, cfg.transport_port);
    tokio::spawn(async move {
        if let Err(e) =
            discovery::run_discovery(local, discovery_port, transport_port, connect_tx).await
        {
            warn!(error = %e, "discovery stopped");
        }
    });
    let node_trans = node.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::run_transport(node_trans, transport_port, connect_rx).await {
            warn!(error = %e, "transport stopped");
        }
    });
    tokio::spawn(transport::run_ticker(node.clone()));
    tokio::spawn(chat::run_deliveries(node.clone(), delivery_rx, geo.clone()));
    let node_console = node.clone();
    tokio::spawn(async move {
        if let Err(e) = console::run_console(node_console, geo).await {
            warn!(error = %e, "console stopped");
        }
    });

    shutdown_signal().await?;
    info!("shutting down");
    match core.leave() {
        Ok(actions) => node.dispatch(actions).await,
        Err(e) => warn!(error = %e, "leave failed"),
    }
    // Give link writers a moment to flush the leave.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
