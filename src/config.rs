use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Gateway configuration, loaded from a YAML file.
///
/// Every field has a default so the binary can also start bare and be fed
/// entries through the registration interface.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address of the SOCKS5 listener.
    #[serde(default = "default_socks5_listen")]
    pub socks5_listen: String,

    /// Bind address of the HTTP proxy listener.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// Route table snapshot. Loaded at startup when present; rewritten on
    /// every successful upsert so registrations survive a restart.
    #[serde(default)]
    pub routes_file: Option<PathBuf>,

    /// TCP dial timeout towards upstreams, in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Bound on each handshake phase (client-facing and upstream-facing),
    /// in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Abort a relay after this many seconds without traffic. Off when
    /// unset; an established tunnel then lives until either peer closes.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// How long shutdown waits for in-flight sessions to drain, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_socks5_listen() -> String {
    "0.0.0.0:1080".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:1089".to_string()
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socks5_listen: default_socks5_listen(),
            http_listen: default_http_listen(),
            routes_file: None,
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
