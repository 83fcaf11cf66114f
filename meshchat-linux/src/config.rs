//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// Daemon configuration. File: ~/.config/meshchat/config.toml or /etc/meshchat/config.toml.
/// Env overrides: MESHCHAT_NICKNAME, MESHCHAT_DISCOVERY_PORT, MESHCHAT_TRANSPORT_PORT,
/// MESHCHAT_IDENTITY_PATH.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Where the identity keys live. Defaults under the user's data directory.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    /// Geohash channel to follow over the relay bridge.
    #[serde(default)]
    pub geohash: Option<String>,
    /// Protocol tunables, the `[core]` table.
    #[serde(default)]
    pub core: meshchat_core::Config,
}

fn default_nickname() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anon".to_string())
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            identity_path: None,
            geohash: None,
            core: meshchat_core::Config::default(),
        }
    }
}

impl Config {
    pub fn identity_path(&self) -> PathBuf {
        if let Some(p) = &self.identity_path {
            return p.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share/meshchat/identity.key"),
            None => PathBuf::from("/var/lib/meshchat/identity.key"),
        }
    }

    /// Apply overrides from `lookup` (the process environment in [`load`]).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(nick) = lookup("MESHCHAT_NICKNAME").filter(|s| !s.trim().is_empty()) {
            self.nickname = nick;
        }
        if let Some(p) = lookup("MESHCHAT_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = lookup("MESHCHAT_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(p) = lookup("MESHCHAT_IDENTITY_PATH").filter(|s| !s.is_empty()) {
            self.identity_path = Some(PathBuf::from(p));
        }
    }
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c.core = c.core.normalized();
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return None;
        }
    };
    match parse(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config invalid, using defaults");
            None
        }
    }
}
