//! swgp-relay: simple WireGuard proxy relay
//!
//! This crate obfuscates WireGuard traffic by wrapping each datagram in a
//! swgp envelope. The server service sits in front of a real WireGuard
//! endpoint: clients send obfuscated datagrams to a single UDP listener,
//! the relay decrypts them in place and forwards them upstream from a
//! dedicated per-client socket, and replies flow back encrypted through
//! the listener, leaving via the same local address the client hit.
//!
//! # Architecture
//!
//! ```text
//! swgp client → UDP listener → decrypt → NAT table → upstream socket → WireGuard
//!                   ↑                                     │
//!                   └────────── encrypt ←─────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use swgp_relay::config::load_config;
//! use swgp_relay::server::Server;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/swgp-relay/config.json")?;
//!
//! let server = Server::new(config.servers[0].clone());
//! server.start().await?;
//! // ...
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`io`]: Packet buffer pool
//! - [`packet`]: swgp packet handlers (the obfuscation layer)
//! - [`server`]: The server relay service
//! - [`socket`]: UDP socket primitives (pktinfo, fwmark, ancillary data)

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod io;
pub mod packet;
pub mod server;
pub mod socket;

// Re-export commonly used types at the crate root
pub use config::{Config, ServerConfig};
pub use error::{ConfigError, HandlerError, SocketError, StartError, SwgpError};
pub use packet::{get_handler, Handler};
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
