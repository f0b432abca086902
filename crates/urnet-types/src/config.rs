//! Configuration types for a URNET process.
//!
//! Loaded from `~/.urnet/config.toml`; every field has a default so an
//! empty or missing file yields a usable hub configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Shortest aging interval honoured; smaller values are raised to it.
pub const MIN_AGE_INTERVAL_MS: u64 = 10;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub directory: DirectoryConfig,
    pub network: NetworkConfig,
}

/// Routing and bookkeeping settings for one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Fixed self address. When unset the directory starts as `SVR_01` and
    /// adopts the address assigned by the first hub it connects to.
    pub address: Option<String>,
    /// Prefix for addresses allocated to attached adapters.
    pub address_prefix: String,
    /// Interval between socket aging ticks.
    pub age_interval_ms: u64,
    /// Idle ticks after which a socket is detached.
    pub max_socket_age: u32,
    /// How long a call or ping may stay pending.
    pub call_timeout_ms: u64,
    /// Upper bound on the hop sequence length.
    pub max_hops: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            address: None,
            address_prefix: crate::address::DEFAULT_PREFIX.to_string(),
            age_interval_ms: 5_000,
            max_socket_age: 6,
            call_timeout_ms: 10_000,
            max_hops: 16,
        }
    }
}

impl DirectoryConfig {
    pub fn age_interval(&self) -> Duration {
        Duration::from_millis(self.age_interval_ms.max(MIN_AGE_INTERVAL_MS))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Listening transports and handshake authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local-pipe (Unix domain socket) path to listen on.
    pub pipe_path: Option<PathBuf>,
    /// Web-socket `host:port` to listen on.
    pub ws_listen: Option<String>,
    /// Pre-shared key for handshake HMAC. Unauthenticated when unset.
    pub shared_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.directory.address_prefix, "UADDR");
        assert_eq!(config.directory.call_timeout(), Duration::from_secs(10));
        assert!(config.network.pipe_path.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BusConfig = toml::from_str(
            r#"
            [directory]
            address = "SVR_07"
            max_socket_age = 3

            [network]
            ws_listen = "127.0.0.1:2929"
            "#,
        )
        .unwrap();
        assert_eq!(config.directory.address.as_deref(), Some("SVR_07"));
        assert_eq!(config.directory.max_socket_age, 3);
        assert_eq!(config.directory.age_interval_ms, 5_000);
        assert_eq!(config.network.ws_listen.as_deref(), Some("127.0.0.1:2929"));
        assert!(config.network.shared_secret.is_none());
    }

    #[test]
    fn test_zero_age_interval_is_raised() {
        let config: DirectoryConfig = toml::from_str("age_interval_ms = 0").unwrap();
        assert_eq!(
            config.age_interval(),
            Duration::from_millis(MIN_AGE_INTERVAL_MS)
        );
    }
}
