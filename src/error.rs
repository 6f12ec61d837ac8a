//! Error types for swgp-relay
//!
//! This module defines the error hierarchy for the relay. Errors are
//! categorized by subsystem and include recovery hints: startup errors are
//! fatal and surface out of `Server::start`, while data-plane errors are
//! handled locally by the relay loops.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for swgp-relay
#[derive(Debug, Error)]
pub enum SwgpError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Service startup errors
    #[error("Startup error: {0}")]
    Start(#[from] StartError),

    /// Socket setup and control-message errors
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// Packet handler errors
    #[error("Packet handler error: {0}")]
    Handler(#[from] HandlerError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SwgpError {
    /// Check if this error is recoverable (the relay loop can continue)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Start(_) => false,
            Self::Socket(e) => e.is_recoverable(),
            Self::Handler(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors surfaced from `Server::start`.
///
/// None of these are recoverable: the service does not begin.
#[derive(Debug, Error)]
pub enum StartError {
    /// MTU below the IPv6 minimum
    #[error("MTU {mtu} is less than the minimum of 1280")]
    MtuTooSmall { mtu: u32 },

    /// The packet buffer cannot hold anything beyond the handler overhead
    #[error("packet buffer size {size} must be greater than total handler overhead {overhead}")]
    PacketBufferSize { size: usize, overhead: usize },

    /// Handler construction failed (unknown mode, bad PSK length)
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// PSK is not valid base64
    #[error("proxy PSK is not valid base64: {0}")]
    PskEncoding(#[from] base64::DecodeError),

    /// Upstream endpoint did not parse and did not resolve
    #[error("failed to resolve WireGuard endpoint {endpoint}: {reason}")]
    ResolveEndpoint { endpoint: String, reason: String },

    /// Listener bind failure
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// I/O error during startup
    #[error("I/O error during startup: {0}")]
    Io(#[from] io::Error),
}

/// Socket setup and control-message errors
#[derive(Debug, Error)]
pub enum SocketError {
    /// Failed to create a UDP socket
    #[error("Failed to create UDP socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option (`IP_PKTINFO`, `SO_MARK`, ...)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// A received datagram or its control messages were truncated
    #[error("Truncated message: {0}")]
    Truncated(String),

    /// Malformed control message buffer
    #[error("Failed to parse control messages: {0}")]
    ControlMessage(String),

    /// I/O error
    #[error("Socket I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SocketError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation(_) | Self::SocketOption { .. } | Self::BindError { .. } => false,
            Self::Truncated(_) | Self::ControlMessage(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Packet handler errors
///
/// Registry errors (`UnknownProxyMode`, `PskLength`) abort startup.
/// The per-packet variants are recoverable: the offending datagram is
/// dropped and the relay loop continues.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Proxy mode string not recognized by the registry
    #[error("unknown proxy mode: {0}")]
    UnknownProxyMode(String),

    /// PSK has the wrong length for the selected mode
    #[error("proxy mode {mode} requires a {expected}-byte PSK, got {actual} bytes")]
    PskLength {
        mode: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Packet too short or too long for the mode's wire format
    #[error("bad packet length {len}")]
    PacketSize { len: usize },

    /// Plaintext does not fit in the buffer together with the overhead
    #[error("payload of {len} bytes at offset {start} does not fit in a {cap}-byte buffer")]
    BufferSpace { start: usize, len: usize, cap: usize },

    /// Authentication or format failure while decrypting
    #[error("failed to decrypt swgp packet")]
    Decrypt,
}

impl HandlerError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownProxyMode(_) | Self::PskLength { .. } => false,
            Self::PacketSize { .. } | Self::BufferSpace { .. } | Self::Decrypt => true,
        }
    }
}

/// Type alias for Result with SwgpError
pub type Result<T> = std::result::Result<T, SwgpError>;
