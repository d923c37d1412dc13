//! Bounded lock-free single-producer/single-consumer queue of frame handles.
//!
//! A ring of `capacity` slots with `capacity - 1` usable entries. The
//! producer owns `tail`, the consumer owns `head`; each publishes its index
//! with release ordering after touching the slot and loads the opposite index
//! with acquire. Ownership of a frame passes through the queue with its
//! handle, so an empty slot is simply `None`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::FrameHandle;

/// SPSC queue of [`FrameHandle`]s.
pub struct FrameQueue {
    slots: Box<[UnsafeCell<Option<FrameHandle>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: a slot is written only by the producer between its full-check and
// the tail publication, and read only by the consumer between its empty-check
// and the head publication; the release/acquire pairs on head and tail order
// those accesses.
unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}

impl FrameQueue {
    /// Create a queue with `capacity` slots (`capacity - 1` usable).
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity >= 2, "queue capacity must be at least 2");
        let slots: Box<[UnsafeCell<Option<FrameHandle>>]> =
            (0..capacity).map(|_| UnsafeCell::new(None)).collect();
        Arc::new(Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }

    /// Enqueue a frame. When the queue is full the frame comes back in `Err`
    /// so the producer can reuse it (back-pressure).
    pub fn push(&self, frame: FrameHandle) -> Result<(), FrameHandle> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.wrap(tail + 1);
        if next == self.head.load(Ordering::Acquire) {
            return Err(frame);
        }
        // SAFETY: slot `tail` is outside the consumer's visible range until
        // the tail store below.
        unsafe {
            *self.slots[tail].get() = Some(frame);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Dequeue the oldest frame, or `None` when empty.
    pub fn pop(&self) -> Option<FrameHandle> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: slot `head` was published by the producer's tail store.
        let frame = unsafe { (*self.slots[head].get()).take() };
        self.head.store(self.wrap(head + 1), Ordering::Release);
        frame
    }

    /// Current number of queued frames.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.slots.len() - head) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable capacity (one slot is reserved to distinguish full from empty).
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    fn wrap(&self, index: usize) -> usize {
        index % self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FramePool;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let pool = FramePool::new(8, 16, 1);
        let queue = FrameQueue::new(8);

        for ts in 0..5u64 {
            let mut frame = pool.acquire().unwrap();
            frame.set_timestamp_ns(ts);
            queue.push(frame).ok().unwrap();
        }
        assert_eq!(queue.len(), 5);
        for ts in 0..5u64 {
            let frame = queue.pop().unwrap();
            assert_eq!(frame.timestamp_ns(), ts);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_returns_frame() {
        let pool = FramePool::new(8, 16, 1);
        let queue = FrameQueue::new(4);
        assert_eq!(queue.capacity(), 3);

        for _ in 0..3 {
            queue.push(pool.acquire().unwrap()).ok().unwrap();
        }
        let extra = pool.acquire().unwrap();
        let rejected = queue.push(extra);
        assert!(rejected.is_err());
        // The frame came back; nothing leaked.
        drop(rejected);
        assert_eq!(pool.frames_in_flight(), 3);
    }

    #[test]
    fn test_dropping_queue_releases_frames() {
        let pool = FramePool::new(4, 16, 1);
        {
            let queue = FrameQueue::new(4);
            queue.push(pool.acquire().unwrap()).ok().unwrap();
            queue.push(pool.acquire().unwrap()).ok().unwrap();
            assert_eq!(pool.frames_in_flight(), 2);
        }
        assert_eq!(pool.frames_in_flight(), 0);
    }

    /// One producer, one consumer, a million frames through a small pool
    /// and queue; every produced value is consumed exactly once.
    #[test]
    fn test_spsc_under_load() {
        const FRAMES: u64 = 1_000_000;
        let pool = FramePool::new(32, 4, 1);
        let queue = FrameQueue::new(16);

        let producer_pool = Arc::clone(&pool);
        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            let mut produced_sum = 0u64;
            for value in 0..FRAMES {
                let mut frame = loop {
                    match producer_pool.acquire() {
                        Some(frame) => break frame,
                        None => thread::yield_now(),
                    }
                };
                frame.set_timestamp_ns(value);
                // Queue full: keep the handle and retry, never release from
                // the producer thread.
                let mut pending = frame;
                loop {
                    match producer_queue.push(pending) {
                        Ok(()) => break,
                        Err(rejected) => {
                            pending = rejected;
                            thread::yield_now();
                        }
                    }
                }
                produced_sum += value;
            }
            produced_sum
        });

        let consumer_queue = Arc::clone(&queue);
        let consumer = thread::spawn(move || {
            let mut consumed_sum = 0u64;
            let mut consumed = 0u64;
            while consumed < FRAMES {
                match consumer_queue.pop() {
                    Some(frame) => {
                        consumed_sum += frame.timestamp_ns();
                        consumed += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            consumed_sum
        });

        let produced_sum = producer.join().unwrap();
        let consumed_sum = consumer.join().unwrap();
        assert_eq!(produced_sum, consumed_sum);
        assert_eq!(pool.frames_in_flight(), 0);
    }
}
