//! Configuration types for swgp-relay

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Server services to run
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one server must be configured".into(),
            ));
        }

        let mut names: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !names.insert(&server.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate server name: {}",
                    server.name
                )));
            }
        }

        Ok(())
    }
}

/// Configuration for one swgp server service.
///
/// The service listens for obfuscated client traffic on `proxy_listen` and
/// relays it as cleartext WireGuard to `wg_endpoint`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Service name, used in logs
    pub name: String,

    /// Address the proxy listener binds to
    pub proxy_listen: SocketAddr,

    /// Proxy mode selecting the packet handler ("zero-overhead", "paranoid")
    pub proxy_mode: String,

    /// Pre-shared key for the packet handler, base64-encoded
    #[serde(rename = "proxyPSK")]
    pub proxy_psk: String,

    /// Firewall mark for the proxy listener (0 = unset)
    #[serde(default)]
    pub proxy_fwmark: u32,

    /// WireGuard endpoint, `ip:port` or `host:port`
    pub wg_endpoint: String,

    /// Firewall mark for per-session upstream sockets (0 = unset)
    #[serde(default)]
    pub wg_fwmark: u32,

    /// Interface MTU; must be at least 1280
    pub mtu: u32,

    /// Disable batch sendmmsg paths (accepted for compatibility; this
    /// implementation always relays one datagram at a time)
    #[serde(default)]
    pub disable_sendmmsg: bool,
}

impl ServerConfig {
    /// Validate this server's configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "Server name must not be empty".into(),
            ));
        }
        if self.proxy_mode.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Server {}: proxy mode must not be empty",
                self.name
            )));
        }
        if self.wg_endpoint.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Server {}: WireGuard endpoint must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}
