//! Underrun-concealing playback rendering
//!
//! Converts queued sample blocks into the fixed-size blocks the playback
//! callback demands. Every delivered block gets a linear fade-in at its
//! leading edge so jitter-induced block boundaries never click; when the
//! queue runs dry the previous audio is faded out to silence instead of
//! being repeated or cut.
//!
//! This runs on the real-time playback thread: the queue pop never blocks,
//! and the fade-state lock is held only to take or put the buffer, never
//! across the fade arithmetic.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::queue::BoundedAudioQueue;

struct FadeState {
    /// Last rendered source samples (zero-length until first render)
    buf: Vec<f32>,
    /// Position within the fade-out window, accumulated across consecutive
    /// underrun callbacks, reset by every delivered block
    fade_out_pos: usize,
}

pub struct PlaybackCrossfader {
    queue: Arc<BoundedAudioQueue>,
    fade_samples: usize,
    state: Mutex<FadeState>,
}

impl PlaybackCrossfader {
    pub fn new(queue: Arc<BoundedAudioQueue>, fade_samples: usize) -> Self {
        Self {
            queue,
            fade_samples,
            state: Mutex::new(FadeState {
                buf: Vec::new(),
                fade_out_pos: 0,
            }),
        }
    }

    /// Fill `data` with the next rendered block. Invoked by the playback
    /// device callback.
    pub fn render(&self, data: &mut [f32]) {
        match self.queue.pop() {
            Some(block) => {
                let mut fade = std::mem::take(&mut self.state.lock().buf);

                fade.resize(data.len(), 0.0);
                let copied = data.len().min(block.samples.len());
                fade[..copied].copy_from_slice(&block.samples[..copied]);
                fade[copied..].fill(0.0);

                for (i, out) in data.iter_mut().enumerate() {
                    *out = fade[i] * self.fade_in_gain(i);
                }

                let mut state = self.state.lock();
                state.buf = fade;
                state.fade_out_pos = 0;
            }
            None => {
                let (fade, pos) = {
                    let mut state = self.state.lock();
                    (std::mem::take(&mut state.buf), state.fade_out_pos)
                };

                if fade.is_empty() {
                    // Nothing has been rendered yet
                    data.fill(0.0);
                } else {
                    for (i, out) in data.iter_mut().enumerate() {
                        let src = if i < fade.len() { fade[i] } else { 0.0 };
                        *out = src * self.fade_out_gain(pos + i);
                    }
                }

                let mut state = self.state.lock();
                state.buf = fade;
                state.fade_out_pos = pos.saturating_add(data.len());
            }
        }
    }

    /// Fade window length in samples
    pub fn fade_samples(&self) -> usize {
        self.fade_samples
    }

    fn fade_in_gain(&self, i: usize) -> f32 {
        if i >= self.fade_samples {
            1.0
        } else {
            i as f32 / self.fade_samples as f32
        }
    }

    fn fade_out_gain(&self, pos: usize) -> f32 {
        if pos >= self.fade_samples {
            0.0
        } else {
            1.0 - pos as f32 / self.fade_samples as f32
        }
    }
}
