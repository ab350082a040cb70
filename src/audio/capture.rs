//! Audio capture
//!
//! The capture device writes into a circular sample buffer with a
//! monotonically advancing write cursor; the network send loop trails it
//! with its own read cursor. The cpal stream is `!Send`, so the adapter
//! owns it on a dedicated thread for the lifetime of the capture.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::error::AudioError;

/// Circular capture buffer shared between the device callback (writer) and
/// the send loop (reader).
///
/// The writer advances `write_pos` modulo the capacity after each callback;
/// the reader computes how much is new as
/// `(write_pos - cursor + capacity) % capacity`. The lock is held only for
/// the sample copy.
pub struct CaptureRing {
    buf: Mutex<Box<[f32]>>,
    write_pos: AtomicUsize,
    capacity: usize,
}

impl CaptureRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capture ring capacity must be non-zero");
        Self {
            buf: Mutex::new(vec![0.0; capacity].into_boxed_slice()),
            write_pos: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Ring capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current write cursor, in samples, modulo the capacity
    pub fn write_position(&self) -> usize {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Append captured samples, wrapping at the end of the ring.
    /// Called from the capture device callback only.
    pub fn write(&self, samples: &[f32]) {
        // A burst larger than the ring keeps only the trailing samples
        let skip = samples.len().saturating_sub(self.capacity);
        let samples = &samples[skip..];

        let mut pos = self.write_pos.load(Ordering::Relaxed);
        {
            let mut buf = self.buf.lock();
            for &s in samples {
                buf[pos] = s;
                pos = (pos + 1) % self.capacity;
            }
        }
        self.write_pos.store(pos, Ordering::Release);
    }

    /// Copy `dest.len()` samples starting at `from`, wrapping at the end of
    /// the ring. Called from the send loop only.
    pub fn read_at(&self, dest: &mut [f32], from: usize) {
        debug_assert!(dest.len() <= self.capacity);
        let buf = self.buf.lock();
        let mut pos = from % self.capacity;
        for d in dest.iter_mut() {
            *d = buf[pos];
            pos = (pos + 1) % self.capacity;
        }
    }
}

/// Handler for asynchronous device stream errors, invoked from the
/// adapter's worker thread after a successful start
pub type OnError = Box<dyn Fn(AudioError) + Send + 'static>;

/// How long a device gets to build and start its stream before start()
/// gives up
pub(crate) const STREAM_START_TIMEOUT: Duration = Duration::from_secs(2);

/// A source of live captured audio
pub trait CaptureSource: Send {
    /// Whether a capture device can be opened right now
    fn is_available(&self) -> bool;

    /// Start capturing into the ring. Returns only once the device stream
    /// is running; later stream errors go through `on_error`.
    fn start(&mut self, on_error: OnError) -> Result<(), AudioError>;

    /// Stop capturing and release the device
    fn stop(&mut self);

    /// The ring this source writes into
    fn ring(&self) -> Arc<CaptureRing>;
}

/// cpal-backed capture from the default input device
pub struct CpalCapture {
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    ring: Arc<CaptureRing>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new(sample_rate: u32, channels: u16, ring_samples: usize) -> Self {
        Self {
            sample_rate,
            channels,
            running: Arc::new(AtomicBool::new(false)),
            ring: Arc::new(CaptureRing::new(ring_samples)),
            thread_handle: None,
        }
    }
}

impl CaptureSource for CpalCapture {
    fn is_available(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&mut self, on_error: OnError) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_input_device()
            .ok_or(AudioError::NoCaptureDevice)?;

        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // The stream is built on the worker thread; its build/play result
        // comes back over this channel so a rejected config fails start()
        // instead of leaving a silent session.
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let ring = self.ring.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        ring.write(data);
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

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping capture
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
                tracing::warn!("Capture stream did not start in time, detaching");
                Err(AudioError::StreamError(
                    "capture stream did not start in time".into(),
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

    fn ring(&self) -> Arc<CaptureRing> {
        self.ring.clone()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
