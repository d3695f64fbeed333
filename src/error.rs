//! Error types for airband-relay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Ingest errors
    #[error("Malformed datagram on channel {channel}: {len} bytes is not a multiple of 4")]
    MalformedDatagram { channel: String, len: usize },

    #[error("UDP bind failed on {address}: {message}")]
    UdpBind { address: String, message: String },

    // DSP errors
    #[error("Invalid filter design: {message}")]
    FilterDesign { message: String },

    #[error("Resampler error: {message}")]
    Resampler { message: String },

    #[error("Invalid emissions designator '{code}': {message}")]
    Designator { code: String, message: String },

    // Archive errors
    #[error("Disk writer stream '{variant}' does not exist")]
    UnknownStream { variant: String },

    #[error("WAV write failed: {0}")]
    Wav(#[from] hound::Error),

    // Process supervision errors
    #[error("Failed to spawn '{program}': {message}")]
    ProcessSpawn { program: String, message: String },

    #[error("Upstream '{name}' not ready: {reason}")]
    UpstreamNotReady { name: String, reason: String },

    // Downstream errors
    #[error("Backend delivery failed: {message}")]
    Backend { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RelayError>;
