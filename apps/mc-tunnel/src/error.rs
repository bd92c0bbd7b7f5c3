use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid token: {0}")]
    TokenFormat(String),
    #[error("signaling rejected: {0}")]
    SignalingRejected(String),
    #[error("path discovery did not complete within {timeout:?}")]
    PathDiscoveryTimeout { timeout: Duration },
    #[error("cannot connect to {address}: {reason}")]
    Dial { address: String, reason: String },
    #[error("cannot listen on {address}: {reason}")]
    Listen { address: String, reason: String },
    #[error("{operation} timed out after {timeout:?}")]
    IoTimeout { operation: String, timeout: Duration },
    #[error("file {path:?}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("transport setup failed: {0}")]
    Setup(String),
}

impl TunnelError {
    /// Short stable name of the error class, used in logs and observer lines.
    pub fn class(&self) -> &'static str {
        match self {
            TunnelError::TokenFormat(_) => "token_format",
            TunnelError::SignalingRejected(_) => "signaling_rejected",
            TunnelError::PathDiscoveryTimeout { .. } => "path_discovery_timeout",
            TunnelError::Dial { .. } => "dial",
            TunnelError::Listen { .. } => "listen",
            TunnelError::IoTimeout { .. } => "io_timeout",
            TunnelError::File { .. } => "file",
            TunnelError::Setup(_) => "setup",
        }
    }
}

/// Failure of a single send on a tunnel channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("tunnel channel closed")]
    Closed,
    #[error("tunnel channel transport error: {0}")]
    Transport(String),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TunnelError {
    TunnelError::Setup(err.to_string())
}

pub(crate) fn to_rejected<E: std::fmt::Display>(err: E) -> TunnelError {
    TunnelError::SignalingRejected(err.to_string())
}
