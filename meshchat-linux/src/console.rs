//! Line console on stdin: plain lines go to the mesh, slash commands do the rest.

use std::sync::Arc;

use anyhow::Context;
use meshchat_core::PeerId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::chat::GeoChannel;
use crate::transport::Node;

const HELP: &str = "\
  <text>                 public message to the mesh
  /msg <peer-id> <text>  private message (16 hex digit peer id)
  /geo <text>            post to the geohash channel via the relay bridge
  /peers                 list known peers
  /help                  this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Public(String),
    Private { to: PeerId, text: String },
    Geo(String),
    Peers,
    Help,
}

/// `None` for blank lines and malformed commands.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Public(line.to_string()));
    };
    let (cmd, args) = match rest.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    match cmd {
        "msg" => {
            let (peer, text) = args.split_once(' ')?;
            let to = PeerId::from_hex(peer)?;
            let text = text.trim();
            (!text.is_empty()).then(|| Command::Private {
                to,
                text: text.to_string(),
            })
        }
        "geo" if !args.is_empty() => Some(Command::Geo(args.to_string())),
        "peers" => Some(Command::Peers),
        "help" => Some(Command::Help),
        _ => None,
    }
}

pub async fn run_console(node: Arc<Node>, geo: Option<Arc<GeoChannel>>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            if !line.trim().is_empty() {
                println!("unknown command, try /help");
            }
            continue;
        };
        if let Err(e) = execute(&node, geo.clone(), command).await {
            warn!(error = %e, "command failed");
            println!("error: {e:#}");
        }
    }
    Ok(())
}

async fn execute(node: &Node, geo: Option<Arc<GeoChannel>>, command: Command) -> anyhow::Result<()> {
    let core = node.core();
    match command {
        Command::Public(text) => node.dispatch(core.send_public_message(&text)?).await,
        Command::Private { to, text } => {
            let (_, actions) = core.send_private_message(to, &text)?;
            node.dispatch(actions).await;
        }
        Command::Geo(text) => {
            let geo = geo.context("no geohash channel configured")?;
            let nickname = core.nickname();
            let envelope =
                tokio::task::spawn_blocking(move || geo.compose(&text, Some(&nickname))).await??;
            node.dispatch(core.send_relay_envelope(&envelope)?).await;
        }
        Command::Peers => {
            let linked = node.linked_peers().await;
            let mut ids = core.peers().peer_ids();
            ids.sort();
            for id in ids {
                if let Some(p) = core.peers().get(id) {
                    let link = if linked.contains(&id) { " (linked)" } else { "" };
                    let verified = if p.is_verified { " verified" } else { "" };
                    println!("{id} {}{verified}{link}", p.nickname);
                }
            }
        }
        Command::Help => println!("{HELP}"),
    }
    Ok(())
}
