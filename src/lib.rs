//! # Duplex Audio Link
//!
//! Real-time duplex audio streaming between two peers over a TCP connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            LOCAL PEER                            │
//! │  ┌──────────────┐        ┌──────────────┐       ┌─────────────┐  │
//! │  │ Capture Ring │───────▶│ PacketFramer │──────▶│  Send Loop  │  │
//! │  │ (cpal input) │ cursor │ (deflate+CRC)│ bytes │ (TCP write) │  │
//! │  └──────────────┘        └──────────────┘       └──────┬──────┘  │
//! │                                                        │         │
//! │  ┌──────────────┐        ┌──────────────┐       ┌──────┴──────┐  │
//! │  │ cpal output  │◀───────│  Crossfader  │◀──────│  Recv Loop  │  │
//! │  │  callback    │  pull  │ + bounded    │ push  │ (TCP read + │  │
//! │  └──────────────┘        │   queue      │       │   decode)   │  │
//! │                          └──────────────┘       └─────────────┘  │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ TCP (raw frames or framed packets)
//!                                 ▼
//!                            REMOTE PEER (same layout, mirrored)
//! ```
//!
//! The four execution contexts (capture callback, playback callback, send
//! loop, receive loop) meet at exactly two shared points: the bounded audio
//! queue and the crossfader's fade state. Everything else is exclusively
//! owned by one context.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default send-loop tick period in milliseconds
    pub const DEFAULT_SEND_INTERVAL_MS: u64 = 100;

    /// Bounded audio queue capacity (in blocks)
    pub const QUEUE_CAPACITY: usize = 100;

    /// Crossfade window in milliseconds
    pub const FADE_DURATION_MS: u32 = 100;

    /// Receive-loop poll interval when the connection is idle
    pub const RECV_POLL_MS: u64 = 10;

    /// Receive buffer size in bytes
    pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

    /// Connection establishment timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 5;

    /// Grace period when joining transport loops during teardown
    pub const TEARDOWN_GRACE_SECS: u64 = 2;

    /// Capture ring length in seconds of audio
    pub const CAPTURE_RING_SECS: usize = 4;

    /// Default TCP port for the audio link
    pub const DEFAULT_PORT: u16 = 7010;
}
