//! Application configuration
//!
//! Loaded from a TOML file in the platform config directory (or an explicit
//! path), with every field defaulting to the values the protocol was tuned
//! for.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::FramingMode;
use crate::constants::*;
use crate::error::{Error, Result};

/// Streaming parameters shared by both directions of the link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Interleaved channel count
    pub channels: u16,

    /// Send-loop tick period in milliseconds
    pub send_interval_ms: u64,

    /// Samples per network frame (all channels interleaved).
    /// One frame covers `send_interval_ms` worth of capture.
    pub samples_per_frame: usize,

    /// Bounded playback queue capacity in blocks
    pub queue_capacity: usize,

    /// Crossfade window in milliseconds
    pub fade_ms: u32,

    /// Wire format: raw frames or framed packets
    pub framing: FramingMode,

    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let sample_rate = DEFAULT_SAMPLE_RATE;
        let channels = DEFAULT_CHANNELS;
        let send_interval_ms = DEFAULT_SEND_INTERVAL_MS;
        Self {
            sample_rate,
            channels,
            send_interval_ms,
            samples_per_frame: frame_samples(sample_rate, channels, send_interval_ms),
            queue_capacity: QUEUE_CAPACITY,
            fade_ms: FADE_DURATION_MS,
            framing: FramingMode::Framed,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        }
    }
}

impl StreamConfig {
    /// Byte length of one uncompressed frame on the wire
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame * std::mem::size_of::<f32>()
    }

    /// Crossfade window expressed in samples
    pub fn fade_samples(&self) -> usize {
        ((self.fade_ms as f64 / 1000.0) * self.sample_rate as f64).round() as usize
    }

    /// Capture ring capacity in samples
    pub fn capture_ring_samples(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * CAPTURE_RING_SECS
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Check internal consistency before a session is built around it
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".into()));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(Error::Config(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        if self.samples_per_frame == 0 {
            return Err(Error::Config("samples_per_frame must be non-zero".into()));
        }
        if self.samples_per_frame % self.channels as usize != 0 {
            return Err(Error::Config(
                "samples_per_frame must be a multiple of the channel count".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be non-zero".into()));
        }
        if self.samples_per_frame >= self.capture_ring_samples() {
            return Err(Error::Config(
                "frame does not fit in the capture ring".into(),
            ));
        }
        Ok(())
    }
}

/// Peer addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the caller connects to
    pub peer_address: String,

    /// Port the listener accepts on
    pub listen_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_address: format!("127.0.0.1:{}", DEFAULT_PORT),
            listen_port: DEFAULT_PORT,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub network: NetworkConfig,
}

impl AppConfig {
    /// Load configuration from the platform config directory, falling back
    /// to defaults when no file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.stream.validate()?;
        Ok(config)
    }

    /// Default config file location (`duplex-audio-link/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "duplex-audio-link")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Samples per frame covering `interval_ms` of capture
pub fn frame_samples(sample_rate: u32, channels: u16, interval_ms: u64) -> usize {
    (sample_rate as u64 * interval_ms / 1000) as usize * channels as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        // 100ms of mono 44.1kHz
        assert_eq!(config.samples_per_frame, 4410);
        assert_eq!(config.fade_samples(), 4410);
    }

    #[test]
    fn frame_samples_covers_interval() {
        assert_eq!(frame_samples(44100, 1, 1000), 44100);
        assert_eq!(frame_samples(48000, 2, 10), 960);
    }

    #[test]
    fn rejects_inconsistent_config() {
        let mut config = StreamConfig::default();
        config.channels = 2;
        config.samples_per_frame = 4411;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            [stream]
            channels = 2
            samples_per_frame = 8820

            [network]
            listen_port = 9000
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.stream.channels, 2);
        assert_eq!(config.stream.sample_rate, 44100);
        assert_eq!(config.network.listen_port, 9000);
        assert!(config.stream.validate().is_ok());
    }
}
