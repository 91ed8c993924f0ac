//! Bounded ring of snapshot copies between the producer and the consumer.
//!
//! The producer copies each host frame into the next free slot; the consumer
//! works through them in order, always finishing a frame (`dequeue`) before
//! the next `peek`. The ring holds one slot more than its advertised
//! capacity, so the slot the consumer is reading is never the slot the
//! producer is writing. That invariant is what lets `enqueue_frame` fill a
//! slot outside the cursor lock.
//!
//! Cursor state lives under one mutex with a single condvar for both "not
//! full" and "not empty", matching the single-producer single-consumer shape
//! of the pipeline. All waits are uninterruptible.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::metrics::PerformanceMetrics;

#[derive(Debug, Default, Clone, Copy)]
struct Cursors {
    produced: u64,
    consumed: u64,
}

impl Cursors {
    fn buffered(&self) -> usize {
        (self.produced - self.consumed) as usize
    }
}

/// Fixed-capacity frame ring. `capacity` is the number of frames that can sit
/// unconsumed before the producer blocks.
pub struct FrameBuffer {
    slots: Vec<Mutex<Box<[u8]>>>,
    capacity: usize,
    cursors: Mutex<Cursors>,
    cond: Condvar,
    metrics: Arc<PerformanceMetrics>,
}

/// Read access to the frame currently at the head of the buffer.
///
/// Holds the slot lock; drop it before calling [`FrameBuffer::dequeue`].
pub struct FrameRef<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl Deref for FrameRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl FrameBuffer {
    pub(crate) fn new(capacity: usize, slot_len: usize, metrics: Arc<PerformanceMetrics>) -> Self {
        // One spare slot keeps the writer off the reader's slot at full
        // capacity.
        let slots = (0..capacity + 1)
            .map(|_| Mutex::new(vec![0u8; slot_len].into_boxed_slice()))
            .collect();
        Self { slots, capacity, cursors: Mutex::new(Cursors::default()), cond: Condvar::new(), metrics }
    }

    /// Frames the producer may enqueue ahead of the consumer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently enqueued and not yet dequeued. Includes the frame the
    /// consumer is holding via [`peek`].
    ///
    /// [`peek`]: Self::peek
    pub fn frames_buffered(&self) -> usize {
        self.cursors.lock().buffered()
    }

    /// Total frames dequeued since the last reset.
    pub fn frames_consumed(&self) -> u64 {
        self.cursors.lock().consumed
    }

    pub fn is_empty(&self) -> bool {
        self.frames_buffered() == 0
    }

    pub fn is_full(&self) -> bool {
        self.frames_buffered() >= self.capacity
    }

    /// Clears the cursors for a fresh session. The caller must ensure no
    /// producer or consumer is active.
    pub(crate) fn reset(&self) {
        *self.cursors.lock() = Cursors::default();
    }

    /// Copies the next frame into the ring, blocking while the ring is full.
    ///
    /// The wait shows up in the `intentionally_blocking` metric and the copy
    /// in `copying_to_buffer`. `fill` runs with only the slot lock held, so
    /// the consumer keeps running during the copy.
    pub(crate) fn enqueue_frame(&self, fill: impl FnOnce(&mut [u8])) {
        let index = {
            let mut cursors = self.cursors.lock();
            if cursors.buffered() >= self.capacity {
                self.metrics.intentionally_blocking.start_timing();
                while cursors.buffered() >= self.capacity {
                    self.cond.wait(&mut cursors);
                }
                self.metrics.intentionally_blocking.stop_timing();
            }
            (cursors.produced % self.slots.len() as u64) as usize
        };

        {
            let mut slot = self.slots[index].lock();
            self.metrics.copying_to_buffer.time(|| fill(&mut slot));
        }

        let mut cursors = self.cursors.lock();
        cursors.produced += 1;
        self.cond.notify_all();
    }

    /// Blocks until a frame is available and returns read access to it
    /// without consuming it. Repeated calls return the same frame until
    /// [`dequeue`] advances the cursor.
    ///
    /// [`dequeue`]: Self::dequeue
    pub fn peek(&self) -> FrameRef<'_> {
        let index = {
            let mut cursors = self.cursors.lock();
            while cursors.buffered() == 0 {
                self.cond.wait(&mut cursors);
            }
            (cursors.consumed % self.slots.len() as u64) as usize
        };
        FrameRef { guard: self.slots[index].lock() }
    }

    /// Consumes the frame at the head of the buffer, blocking until one is
    /// available, and wakes the producer. Dequeuing without a prior [`peek`]
    /// is legal; it advances past an unseen frame.
    ///
    /// [`peek`]: Self::peek
    pub fn dequeue(&self) {
        let mut cursors = self.cursors.lock();
        while cursors.buffered() == 0 {
            self.cond.wait(&mut cursors);
        }
        cursors.consumed += 1;
        self.cond.notify_all();
    }

    /// Blocks until the buffer is empty or `deadline` passes. `None` waits
    /// without bound; the producer uses that for frame zero when its duration
    /// is configured as unlimited.
    pub(crate) fn wait_drained(&self, deadline: Option<Instant>) {
        let mut cursors = self.cursors.lock();
        while cursors.buffered() > 0 {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut cursors, deadline).timed_out() {
                        return;
                    }
                }
                None => self.cond.wait(&mut cursors),
            }
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity)
            .field("frames_buffered", &self.frames_buffered())
            .field("frames_consumed", &self.frames_consumed())
            .finish()
    }
}
