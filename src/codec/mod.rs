//! Wire codec for audio frames
//!
//! Each captured frame crosses the wire either as raw little-endian f32
//! samples (lowest latency) or as a deflate-compressed, CRC-checked packet
//! (integrity-checked transport). One mode per deployment.

pub mod framer;

pub use framer::{AudioPacket, FramingMode, PacketFramer, HEADER_LEN};
