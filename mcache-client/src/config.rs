//! # Client Configuration
//!
//! Purpose: Describe the static server list, default time-to-live and the
//! reconnect backoff policy, loadable from JSON.
//!
//! ## Design Principles
//! 1. **Sensible Defaults**: Every field has a default so partial documents
//!    deserialize.
//! 2. **Validate Once**: Addresses and limits are checked when the client is
//!    built, not on every request.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use mcache_common::{validate_expiration, McError, McResult, DEFAULT_HOST, DEFAULT_PORT};

/// One cache server, `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddr {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddr {
    fn default() -> Self {
        ServerAddr::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl FromStr for ServerAddr {
    type Err = McError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| McError::config(format!("invalid port in address {:?}", s)))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Ok(ServerAddr::new(host, port))
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reconnect delays, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay seed before the first ever connection.
    pub initial_ms: u64,
    /// Delay seed after a successful open.
    pub floor_ms: u64,
    /// Upper bound for the doubled delay.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_ms: 10,
            floor_ms: 50,
            max_ms: 128_000,
        }
    }
}

/// Configuration for the cluster client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server addresses; the index is the shard id.
    pub servers: Vec<String>,
    /// Expiration applied to stores that do not set one (seconds, 0 = never).
    pub default_ttl: u32,
    pub backoff: BackoffConfig,
    /// Disable Nagle on every socket.
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: vec![ServerAddr::default().to_string()],
            default_ttl: 0,
            backoff: BackoffConfig::default(),
            nodelay: true,
        }
    }
}

impl ClientConfig {
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document such as `{"servers": ["10.0.0.1:11211"]}`.
    pub fn from_json(json: &str) -> McResult<Self> {
        serde_json::from_str(json).map_err(|err| McError::config(format!("invalid config: {}", err)))
    }

    /// Checks limits and parses the server list.
    pub fn addrs(&self) -> McResult<Vec<ServerAddr>> {
        if self.servers.is_empty() {
            return Err(McError::config("at least one server is required"));
        }
        validate_expiration(self.default_ttl)?;
        if self.backoff.floor_ms == 0 || self.backoff.max_ms < self.backoff.floor_ms {
            return Err(McError::config("backoff requires 0 < floor_ms <= max_ms"));
        }
        self.servers.iter().map(|s| s.parse()).collect()
    }
}

impl BackoffConfig {
    pub(crate) fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub(crate) fn floor(&self) -> Duration {
        Duration::from_millis(self.floor_ms)
    }

    pub(crate) fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}
