//! Error types for mocap-relay

use thiserror::Error;

/// Main error type for mocap-relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("Web server error: {0}")]
    Web(#[from] WebError),

    #[error("Unknown receiver: {0}")]
    UnknownReceiver(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFile(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration value: {field} - {message}")]
    InvalidValue { field: String, message: String },
}

/// Motion receiver errors. These are transient: the listener loop logs them
/// and retries after its backoff delay.
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake with device {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("Connection closed by peer")]
    Disconnected,
}

/// Malformed input from a capture device
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("Frame buffer exceeded {limit} bytes without a complete frame")]
    BufferOverflow { limit: usize },

    #[error("OSC decode error: {0}")]
    OscDecode(String),
}

/// Scene file errors
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("Failed to read scene file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to write scene file {path}: {message}")]
    Write { path: String, message: String },

    #[error("Invalid scene JSON: {0}")]
    Parse(String),
}

/// Web server errors
#[derive(Error, Debug)]
pub enum WebError {
    #[error("Failed to bind to address: {0}")]
    Bind(String),

    #[error("Server failed: {0}")]
    Serve(String),
}

/// Result type alias for mocap-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
