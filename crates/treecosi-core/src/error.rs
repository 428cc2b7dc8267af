//! Error types for the collective-signing protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building trees or running the protocol
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input (empty roster, bad shard count, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Overlay send or receive failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// A phase deadline expired
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Cryptographic operation failed
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Subleader rotation cycled through every candidate without a commitment
    #[error("shard exhausted: {0}")]
    ShardExhausted(String),

    /// The instance received a stop signal and exited early
    #[error("protocol stopped")]
    Stopped,

    /// Runtime fault outside the protocol itself
    #[error("internal error: {0}")]
    Internal(String),
}
