//! Audio playback
//!
//! The playback device pulls fixed-size sample blocks through a synchronous
//! callback on its own cadence; the crossfader attaches there. Mirrors the
//! capture adapter: the `!Send` cpal stream lives on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;

use crate::audio::capture::{OnError, STREAM_START_TIMEOUT};
use crate::error::AudioError;

/// Callback the sink invokes whenever it needs the next block of samples
pub type OnRead = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// A sink that renders audio by pulling samples through a callback
pub trait PlaybackSink: Send {
    /// Open the device and start pulling through `on_read`. Returns only
    /// once the device stream is running; later stream errors go through
    /// `on_error`.
    fn start(&mut self, on_read: OnRead, on_error: OnError) -> Result<(), AudioError>;

    /// Stop playback and release the device
    fn stop(&mut self);
}

/// cpal-backed playback to the default output device
pub struct CpalPlayback {
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalPlayback {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }
}

impl PlaybackSink for CpalPlayback {
    fn start(&mut self, mut on_read: OnRead, on_error: OnError) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default output device".into()))?;

        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Mirrors the capture adapter: the build/play result comes back
        // from the worker thread so a rejected config fails start().
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if running.load(Ordering::Relaxed) {
                            on_read(data);
                        } else {
                            data.fill(0.0);
                        }
                    },
                    move |err| on_error(AudioError::StreamError(err.to_string())),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(())) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                // The thread may be wedged inside the device call; detach
                // rather than join, it exits on the cleared running flag
                self.running.store(false, Ordering::SeqCst);
                tracing::warn!("Playback stream did not start in time, detaching");
                Err(AudioError::StreamError(
                    "playback stream did not start in time".into(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub mod testing {
    //! Playback double: stores the callback so tests can drive it by hand.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct NullPlayback {
        callback: Arc<Mutex<Option<OnRead>>>,
        on_error: Arc<Mutex<Option<OnError>>>,
        pub fail_start: Option<AudioError>,
        pub started: bool,
        pub stopped: bool,
    }

    impl NullPlayback {
        pub fn new() -> Self {
            Self::default()
        }

        /// Invoke the registered callback the way a device would
        pub fn pull(&self, data: &mut [f32]) {
            if let Some(cb) = self.callback.lock().as_mut() {
                cb(data);
            }
        }

        pub fn callback_handle(&self) -> Arc<Mutex<Option<OnRead>>> {
            self.callback.clone()
        }

        /// The error handler registered at start, so tests can raise
        /// device faults by hand
        pub fn error_handle(&self) -> Arc<Mutex<Option<OnError>>> {
            self.on_error.clone()
        }
    }

    impl PlaybackSink for NullPlayback {
        fn start(&mut self, on_read: OnRead, on_error: OnError) -> Result<(), AudioError> {
            if let Some(e) = self.fail_start.take() {
                return Err(e);
            }
            *self.callback.lock() = Some(on_read);
            *self.on_error.lock() = Some(on_error);
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }
}
