//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::{SessionOptions, DEFAULT_MAX_PENDING};

/// Agent configuration. File: ~/.config/didlink/config.toml or /etc/didlink/config.toml.
/// Env overrides: DIDLINK_SERVER_ADDRESS, DIDLINK_CREDENTIALS, DIDLINK_IO_TIMEOUT,
/// DIDLINK_MAX_PENDING, DIDLINK_P2P_SEED, DIDLINK_P2P_THEIR_VERKEY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay address (default ws://127.0.0.1:8000). http(s) is mapped to ws(s).
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Opaque credentials, sent as a connection header.
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Cap on outstanding correlation futures per session.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Encrypted channel to the relay.
    #[serde(default)]
    pub p2p: Option<P2pConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct P2pConfig {
    /// 32-character seed for this agent's side of the channel.
    pub my_seed: String,
    /// Relay verkey, base58.
    pub their_verkey: String,
}

fn default_server_address() -> String {
    "ws://127.0.0.1:8000".to_string()
}
fn default_io_timeout_secs() -> u64 {
    30
}
fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            credentials: None,
            io_timeout_secs: default_io_timeout_secs(),
            max_pending: default_max_pending(),
            p2p: None,
        }
    }
}

impl Config {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            max_pending: self.max_pending,
        }
    }

    /// Apply overrides from `var`. Unparseable numbers are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("DIDLINK_SERVER_ADDRESS") {
            self.server_address = s;
        }
        if let Some(s) = var("DIDLINK_CREDENTIALS") {
            self.credentials = Some(s);
        }
        if let Some(s) = var("DIDLINK_IO_TIMEOUT") {
            if let Ok(secs) = s.parse::<u64>() {
                self.io_timeout_secs = secs;
            }
        }
        if let Some(s) = var("DIDLINK_MAX_PENDING") {
            if let Ok(n) = s.parse::<usize>() {
                self.max_pending = n;
            }
        }
        match (var("DIDLINK_P2P_SEED"), var("DIDLINK_P2P_THEIR_VERKEY")) {
            (Some(my_seed), Some(their_verkey)) => {
                self.p2p = Some(P2pConfig {
                    my_seed,
                    their_verkey,
                });
            }
            (Some(my_seed), None) => {
                if let Some(p2p) = self.p2p.as_mut() {
                    p2p.my_seed = my_seed;
                }
            }
            (None, Some(their_verkey)) => {
                if let Some(p2p) = self.p2p.as_mut() {
                    p2p.their_verkey = their_verkey;
                }
            }
            (None, None) => {}
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|key| std::env::var(key).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/didlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/didlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}
