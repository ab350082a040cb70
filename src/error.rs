//! Error types for the duplex audio link

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No capture device available")]
    NoCaptureDevice,

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Packet framing and checksum errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Decompressed length mismatch: header says {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Compression failed: {0}")]
    Compress(String),

    #[error("Decompression failed: {0}")]
    Decompress(String),

    #[error("Packet truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("Invalid packet header: {0}")]
    InvalidHeader(String),

    #[error("Invalid frame size: {0} bytes")]
    InvalidFrameSize(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Connection refused")]
    ConnectRefused,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No capture device")]
    NoCaptureDevice,

    #[error("Session is {0:?}, expected Idle")]
    NotIdle(crate::session::SessionState),

    #[error("Session is not streaming")]
    NotStreaming,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
