//! Pre-allocated PCM frame pool.
//!
//! All frame memory is allocated once at pool creation; acquire and release
//! are constant-time and lock-free so the capture path never touches the
//! allocator. The free list is a LIFO stack of frame indices published
//! through a single atomic counter.
//!
//! Contract: one thread acquires (the producer), one thread releases (the
//! consumer). A producer that cannot hand a frame downstream keeps the handle
//! and reuses it rather than releasing from its own thread.

pub mod queue;

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One interleaved float32 PCM frame.
///
/// The sample buffer is sized `frame_capacity * channels` for the lifetime of
/// the pool; `sample_frames` tracks how much of it currently holds audio.
pub struct Frame {
    samples: Box<[f32]>,
    sample_frames: usize,
    frame_capacity: usize,
    channels: u16,
    timestamp_ns: u64,
}

impl Frame {
    fn new(frame_capacity: usize, channels: u16) -> Self {
        Self {
            samples: vec![0.0; frame_capacity * channels as usize].into_boxed_slice(),
            sample_frames: 0,
            frame_capacity,
            channels,
            timestamp_ns: 0,
        }
    }

    /// Valid interleaved samples (`sample_frames * channels` floats).
    pub fn samples(&self) -> &[f32] {
        &self.samples[..self.sample_frames * self.channels as usize]
    }

    /// Full capacity buffer for the producer to fill.
    pub fn buffer_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn sample_frames(&self) -> usize {
        self.sample_frames
    }

    /// Set the number of valid sample frames. Must not exceed capacity.
    pub fn set_sample_frames(&mut self, sample_frames: usize) {
        debug_assert!(sample_frames <= self.frame_capacity);
        self.sample_frames = sample_frames.min(self.frame_capacity);
    }

    pub fn frame_capacity(&self) -> usize {
        self.frame_capacity
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Capture timestamp in TAI nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    #[cfg(debug_assertions)]
    fn poison(&mut self) {
        // Reads of a released frame show up immediately as NaN audio.
        self.samples.fill(f32::NAN);
        self.sample_frames = 0;
    }
}

/// Fixed-size pool of [`Frame`]s with a lock-free LIFO free list.
pub struct FramePool {
    frames: Box<[UnsafeCell<Frame>]>,
    free: Box<[AtomicUsize]>,
    free_count: AtomicUsize,
    capacity: usize,
}

// SAFETY: every frame is referenced mutably by at most one FrameHandle at a
// time; the free list hands an index to exactly one acquirer, and the
// acquire/release orderings on `free_count` order slot contents between the
// acquiring and releasing threads.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Allocate a pool of `capacity` frames, each holding up to
    /// `frame_capacity` sample frames of `channels` channels. All backing
    /// buffers are allocated here, never afterwards.
    pub fn new(capacity: usize, frame_capacity: usize, channels: u16) -> Arc<Self> {
        assert!(capacity > 0, "pool capacity must be nonzero");
        assert!(frame_capacity > 0, "frame capacity must be nonzero");
        assert!((1..=32).contains(&channels), "channel count out of range");

        let frames: Box<[UnsafeCell<Frame>]> = (0..capacity)
            .map(|_| UnsafeCell::new(Frame::new(frame_capacity, channels)))
            .collect();
        let free: Box<[AtomicUsize]> = (0..capacity).map(AtomicUsize::new).collect();

        Arc::new(Self {
            frames,
            free,
            free_count: AtomicUsize::new(capacity),
            capacity,
        })
    }

    /// Pop a free frame, or `None` when the pool is exhausted (back-pressure,
    /// not an error). Real-time safe.
    pub fn acquire(self: &Arc<Self>) -> Option<FrameHandle> {
        let count = self.free_count.load(Ordering::Acquire);
        if count == 0 {
            return None;
        }
        let index = self.free[count - 1].load(Ordering::Relaxed);
        self.free_count.store(count - 1, Ordering::Relaxed);

        // SAFETY: `index` was just removed from the free list, so no other
        // handle refers to this frame.
        let frame = unsafe {
            let ptr = self.frames[index].get();
            (*ptr).sample_frames = 0;
            (*ptr).timestamp_ns = 0;
            NonNull::new_unchecked(ptr)
        };
        Some(FrameHandle {
            frame,
            index,
            pool: Arc::clone(self),
        })
    }

    fn release_index(&self, index: usize) {
        debug_assert!(index < self.capacity);
        let count = self.free_count.load(Ordering::Relaxed);
        if count >= self.capacity {
            // Double release; ignoring it keeps the free list coherent.
            log::error!("frame pool: double release of frame {} ignored", index);
            return;
        }
        #[cfg(debug_assertions)]
        // SAFETY: the handle being dropped held the only reference.
        unsafe {
            (*self.frames[index].get()).poison();
        }
        self.free[count].store(index, Ordering::Relaxed);
        self.free_count.store(count + 1, Ordering::Release);
    }

    /// Number of frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Number of frames currently held outside the pool.
    pub fn frames_in_flight(&self) -> usize {
        self.capacity - self.free_frames()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive borrow of one pooled frame. Dropping the handle returns the
/// frame to its pool.
pub struct FrameHandle {
    frame: NonNull<Frame>,
    index: usize,
    pool: Arc<FramePool>,
}

// SAFETY: the handle is the sole reference to its frame; moving it between
// threads moves that exclusivity with it.
unsafe impl Send for FrameHandle {}

impl Deref for FrameHandle {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // SAFETY: exclusive access guaranteed by the pool free list.
        unsafe { self.frame.as_ref() }
    }
}

impl DerefMut for FrameHandle {
    fn deref_mut(&mut self) -> &mut Frame {
        // SAFETY: as above; &mut self gives unique access to the handle.
        unsafe { self.frame.as_mut() }
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.pool.release_index(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = FramePool::new(4, 64, 2);
        assert_eq!(pool.free_frames(), 4);

        let mut frame = pool.acquire().expect("pool has frames");
        assert_eq!(pool.frames_in_flight(), 1);
        frame.buffer_mut()[0] = 0.5;
        frame.set_sample_frames(64);
        frame.set_timestamp_ns(123);
        assert_eq!(frame.samples().len(), 128);

        drop(frame);
        assert_eq!(pool.free_frames(), 4);
        assert_eq!(pool.frames_in_flight(), 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = FramePool::new(2, 16, 1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop(a);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn test_acquired_frame_is_reset() {
        let pool = FramePool::new(1, 8, 1);
        {
            let mut frame = pool.acquire().unwrap();
            frame.set_sample_frames(8);
            frame.set_timestamp_ns(99);
        }
        let frame = pool.acquire().unwrap();
        assert_eq!(frame.sample_frames(), 0);
        assert_eq!(frame.timestamp_ns(), 0);
    }

    #[test]
    fn test_ownership_conservation() {
        let pool = FramePool::new(8, 16, 1);
        let held: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.frames_in_flight(), held.len());
        drop(held);
        assert_eq!(pool.frames_in_flight(), 0);
        assert_eq!(pool.free_frames(), 8);
    }
}
