//! Error types for the network core.

use thiserror::Error;

/// Errors produced by the network core.
///
/// No variant is ever fatal to the process: every failure is scoped to a
/// single connection or rejected operation.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listening socket could not be created.
    #[error("Bind failed: {0}")]
    Bind(String),

    /// Outbound transport establishment failed.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Remote side closed the stream.
    #[error("End of stream")]
    EndOfStream,

    /// Operation attempted on a closed connection.
    #[error("Connection closed")]
    Closed,

    /// Connect or read-inactivity timeout.
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result alias for network-core operations.
pub type Result<T> = std::result::Result<T, NetError>;
