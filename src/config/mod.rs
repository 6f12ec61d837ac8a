//! Configuration module for swgp-relay
//!
//! Configuration is a JSON document listing the server services to run.
//! Field names are camelCase on the wire and the PSK travels as base64.
//!
//! # Example
//!
//! ```json
//! {
//!     "servers": [
//!         {
//!             "name": "wg0",
//!             "proxyListen": "[::]:20220",
//!             "proxyMode": "zero-overhead",
//!             "proxyPSK": "aGVsbG8td29ybGQtdGhpcy1pcy1hLTMyYi1rZXk=",
//!             "wgEndpoint": "[::1]:51820",
//!             "mtu": 1500
//!         }
//!     ]
//! }
//! ```

mod loader;
mod types;

pub use loader::{load_config, load_config_str};
pub use types::{Config, ServerConfig};
