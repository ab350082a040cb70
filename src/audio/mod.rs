//! Audio subsystem module

pub mod capture;
pub mod crossfade;
pub mod device;
pub mod playback;
pub mod queue;

pub use capture::{CaptureRing, CaptureSource, CpalCapture, OnError};
pub use crossfade::PlaybackCrossfader;
pub use playback::{CpalPlayback, OnRead, PlaybackSink};
pub use queue::{BoundedAudioQueue, SampleBlock};
