//! Error types for fabxfer.

use thiserror::Error;

/// Error type for transfer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error from the underlying fabric provider.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The provider cannot accept the operation right now; retry next loop.
    #[error("resource temporarily unavailable")]
    TryAgain,
    /// The operation was cancelled after an explicit cancel.
    #[error("operation canceled")]
    Canceled,
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The provider lacks a capability the core requires.
    #[error("unsupported provider capability: {0}")]
    Unsupported(&'static str),
    /// A message did not decode to its wire format.
    #[error("malformed {what} message: {detail}")]
    MalformedMessage {
        what: &'static str,
        detail: String,
    },
    /// A completion carried unexpected flags.
    #[error("unexpected completion flags: expected {expected:#x}, got {got:#x}")]
    CompletionFlags { expected: u64, got: u64 },
    /// A completion context did not match the first posted operation.
    #[error("completion context mismatch: expected {expected:#x}, got {got:#x}")]
    ContextMismatch { expected: u64, got: u64 },
    /// A completion arrived with no posted operation to match it.
    #[error("completion arrived, but no operation was posted")]
    NoPostedOp,
    /// The peer violated the transfer protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A buffer pool or FIFO was exhausted where the protocol forbids it.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),
    /// Memory registration failed.
    #[error("memory registration failed: {0}")]
    Registration(String),
    /// The sink observed bytes that do not match the transmit pattern.
    #[error("unexpected received payload at offset {offset}")]
    PayloadMismatch { offset: usize },
    /// One or more workers failed or the cancellation expectation was not met.
    #[error("worker pool finished with failures")]
    WorkersFailed,
    /// No fabric address is known for a peer.
    #[error("unknown peer address")]
    UnknownPeer,
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;
