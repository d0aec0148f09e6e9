//! Real-time safe audio handoff from the JACK callback
//!
//! The JACK process callback may not allocate or block, so audio crosses to
//! the pipeline thread through a bounded lock-free queue of fixed-size
//! chunks. On overflow the oldest chunk is displaced and a counter is
//! bumped; the pipeline sees a gap rather than the callback seeing a stall.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Samples per queue chunk. JACK periods larger than this are split into
/// several chunks inside the callback, still without allocating.
pub const CHUNK_FRAMES: usize = 1024;

/// Default queue depth in chunks (about 1.4 s at 48 kHz)
pub const DEFAULT_QUEUE_CHUNKS: usize = 64;

/// A fixed-size block of mono f32 samples
#[derive(Clone, Copy)]
pub struct AudioChunk {
    len: usize,
    data: [f32; CHUNK_FRAMES],
}

impl AudioChunk {
    fn from_slice(samples: &[f32]) -> Self {
        debug_assert!(samples.len() <= CHUNK_FRAMES);
        let mut data = [0.0f32; CHUNK_FRAMES];
        let len = samples.len().min(CHUNK_FRAMES);
        data[..len].copy_from_slice(&samples[..len]);
        Self { len, data }
    }

    /// The valid samples in this chunk
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.data[..self.len]
    }
}

impl std::fmt::Debug for AudioChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChunk").field("len", &self.len).finish()
    }
}

/// Producer half, owned by the JACK process callback
#[derive(Clone)]
pub struct CaptureSink {
    queue: Arc<ArrayQueue<AudioChunk>>,
    dropped: Arc<AtomicU64>,
    frames: Arc<AtomicU64>,
}

impl CaptureSink {
    /// Push a period of samples, splitting into chunks as needed.
    ///
    /// Real-time safe: no allocation, no locks. A full queue displaces the
    /// oldest chunk and bumps the drop counter.
    pub fn push(&self, buf: &[f32]) {
        for part in buf.chunks(CHUNK_FRAMES) {
            if self.queue.force_push(AudioChunk::from_slice(part)).is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.frames.fetch_add(buf.len() as u64, Ordering::Relaxed);
    }
}

/// Consumer half, owned by the pipeline thread
pub struct CaptureConsumer {
    queue: Arc<ArrayQueue<AudioChunk>>,
    dropped: Arc<AtomicU64>,
    frames: Arc<AtomicU64>,
}

impl CaptureConsumer {
    /// Take the next chunk, if any
    #[must_use]
    pub fn pop(&self) -> Option<AudioChunk> {
        self.queue.pop()
    }

    /// Chunks displaced by overflow since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Total frames pushed by the callback since creation
    #[must_use]
    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Create a connected sink/consumer pair with the given depth in chunks
#[must_use]
pub fn capture_pair(capacity_chunks: usize) -> (CaptureSink, CaptureConsumer) {
    let queue = Arc::new(ArrayQueue::new(capacity_chunks.max(1)));
    let dropped = Arc::new(AtomicU64::new(0));
    let frames = Arc::new(AtomicU64::new(0));
    (
        CaptureSink {
            queue: Arc::clone(&queue),
            dropped: Arc::clone(&dropped),
            frames: Arc::clone(&frames),
        },
        CaptureConsumer {
            queue,
            dropped,
            frames,
        },
    )
}

/// Switchable tap feeding the recording tools.
///
/// Lives inside the JACK callback permanently; while inactive it costs one
/// atomic load per period.
#[derive(Clone)]
pub struct RecorderTap {
    active: Arc<AtomicBool>,
    queue: Arc<ArrayQueue<AudioChunk>>,
    dropped: Arc<AtomicU64>,
}

impl Default for RecorderTap {
    fn default() -> Self {
        Self::new()
    }
}

impl RecorderTap {
    /// Create an inactive tap
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(ArrayQueue::new(DEFAULT_QUEUE_CHUNKS * 4)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Called from the JACK callback; a no-op while inactive
    pub fn push(&self, buf: &[f32]) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        for part in buf.chunks(CHUNK_FRAMES) {
            if self.queue.force_push(AudioChunk::from_slice(part)).is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start routing audio into the tap
    pub fn activate(&self) {
        // Discard anything left over from a previous recording
        while self.queue.pop().is_some() {}
        self.active.store(true, Ordering::Relaxed);
    }

    /// Stop routing audio into the tap
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    /// Whether the tap is currently routing
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Take the next recorded chunk
    #[must_use]
    pub fn pop(&self) -> Option<AudioChunk> {
        self.queue.pop()
    }

    /// Chunks lost to overflow
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let (sink, consumer) = capture_pair(8);
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        sink.push(&samples);

        let chunk = consumer.pop().unwrap();
        assert_eq!(chunk.samples(), samples.as_slice());
        assert!(consumer.pop().is_none());
        assert_eq!(consumer.frames_captured(), 100);
    }

    #[test]
    fn oversized_period_splits_into_chunks() {
        let (sink, consumer) = capture_pair(8);
        let samples = vec![0.25f32; CHUNK_FRAMES * 2 + 10];
        sink.push(&samples);

        assert_eq!(consumer.pop().unwrap().samples().len(), CHUNK_FRAMES);
        assert_eq!(consumer.pop().unwrap().samples().len(), CHUNK_FRAMES);
        assert_eq!(consumer.pop().unwrap().samples().len(), 10);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let (sink, consumer) = capture_pair(2);
        sink.push(&[1.0; CHUNK_FRAMES]);
        sink.push(&[2.0; CHUNK_FRAMES]);
        sink.push(&[3.0; CHUNK_FRAMES]);

        assert_eq!(consumer.dropped(), 1);
        // Oldest chunk (all 1.0) was displaced
        assert!((consumer.pop().unwrap().samples()[0] - 2.0).abs() < f32::EPSILON);
        assert!((consumer.pop().unwrap().samples()[0] - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn inactive_tap_ignores_audio() {
        let tap = RecorderTap::new();
        tap.push(&[0.5; 64]);
        assert!(tap.pop().is_none());

        tap.activate();
        tap.push(&[0.5; 64]);
        assert_eq!(tap.pop().unwrap().samples().len(), 64);

        tap.deactivate();
        tap.push(&[0.5; 64]);
        assert!(tap.pop().is_none());
    }
}
