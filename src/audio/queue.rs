//! Bounded hand-off queue between the receive loop and the playback callback
//!
//! A fixed-capacity FIFO of sample blocks with a drop-oldest overflow policy:
//! real-time playback prefers fresh audio over complete audio. Safe for one
//! producer (the receive loop) and one consumer (the playback device
//! callback) without any locking by the callers.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;

/// One block of interleaved f32 audio samples
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Interleaved audio samples
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
}

impl SampleBlock {
    pub fn new(samples: Vec<f32>, channels: u16) -> Self {
        Self { samples, channels }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Get block duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.samples_per_channel() as u64 * 1_000_000) / sample_rate as u64
    }
}

/// Drop-oldest bounded queue of sample blocks
pub struct BoundedAudioQueue {
    queue: ArrayQueue<SampleBlock>,
    dropped: AtomicUsize,
    underruns: AtomicUsize,
}

impl BoundedAudioQueue {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicUsize::new(0),
            underruns: AtomicUsize::new(0),
        }
    }

    /// Push a block, evicting the oldest one first when the queue is full.
    /// Returns the evicted block, if any.
    pub fn push(&self, block: SampleBlock) -> Option<SampleBlock> {
        let evicted = self.queue.force_push(block);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Pop the oldest block, counting an underrun when empty
    pub fn pop(&self) -> Option<SampleBlock> {
        match self.queue.pop() {
            Some(block) => Some(block),
            None => {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop without counting an underrun
    pub fn try_pop(&self) -> Option<SampleBlock> {
        self.queue.pop()
    }

    /// Remove all queued blocks (session teardown)
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of blocks evicted by the drop-oldest policy
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of empty pops seen by the playback path
    pub fn underrun_count(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.dropped.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(tag: f32) -> SampleBlock {
        SampleBlock::new(vec![tag; 8], 1)
    }

    #[test]
    fn fifo_order() {
        let queue = BoundedAudioQueue::new(4);
        queue.push(block(0.0));
        queue.push(block(1.0));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().samples[0], 0.0);
        assert_eq!(queue.pop().unwrap().samples[0], 1.0);
        assert!(queue.is_empty());
        assert_eq!(queue.underrun_count(), 0);
    }

    #[test]
    fn never_exceeds_capacity() {
        let queue = BoundedAudioQueue::new(10);
        for i in 0..25 {
            queue.push(block(i as f32));
            assert!(queue.len() <= 10);
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.dropped_count(), 15);
    }

    #[test]
    fn overflow_drops_oldest() {
        // 150 distinct blocks into capacity 100: the survivors are #51..=#150
        let queue = BoundedAudioQueue::new(100);
        for i in 1..=150 {
            queue.push(block(i as f32));
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.pop().unwrap().samples[0], 51.0);

        let mut last = 51.0;
        while let Some(b) = queue.try_pop() {
            last = b.samples[0];
        }
        assert_eq!(last, 150.0);
    }

    #[test]
    fn clear_empties_queue() {
        let queue = BoundedAudioQueue::new(8);
        for i in 0..5 {
            queue.push(block(i as f32));
        }
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn pop_counts_underruns() {
        let queue = BoundedAudioQueue::new(4);
        assert!(queue.pop().is_none());
        assert!(queue.pop().is_none());
        assert_eq!(queue.underrun_count(), 2);

        queue.reset_stats();
        assert_eq!(queue.underrun_count(), 0);
    }
}
