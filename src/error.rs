//! Error types for beacon-ring

use thiserror::Error;

/// Result type alias for beacon-ring operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pairing and relaying commands
///
/// None of these are fatal to a running dispatcher: each one is logged and
/// the dispatcher falls back to its idle or disconnected state.
#[derive(Debug, Error)]
pub enum Error {
    /// Local network stack could not bind or broadcast an advertisement
    #[error("advertise error: {0}")]
    Advertise(String),

    /// Local network stack could not enumerate services
    #[error("browse error: {0}")]
    Browse(String),

    /// Outbound connection attempt failed
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// Endpoint that was attempted
        endpoint: String,
        /// Transport-level reason
        reason: String,
    },

    /// Send attempted without a ready connection
    #[error("not connected")]
    NotConnected,

    /// Transport read or write failed on an active connection
    #[error("transport error: {0}")]
    Transport(String),

    /// Capture or recognizer fault
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
