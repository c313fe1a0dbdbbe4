//! Bounded lock-free MPSC queue for inter-thread communication.
//!
//! The dispatcher's inbox and disconnection queues: many producer threads
//! (callers of `augment()`, transport monitors) push, the single loop
//! thread pops.
//!
//! # Algorithm
//!
//! Based on Dmitry Vyukov's bounded MPMC queue, simplified for the
//! single-consumer case:
//!
//! - Each slot has an atomic sequence number
//! - Producers CAS the head to reserve exclusive write positions
//! - After writing, producers publish by setting `slot.seq = pos + 1`
//! - Consumer checks if `slot.seq == tail + 1` before reading
//! - After reading, consumer sets `slot.seq = tail + N` to release the slot
//!
//! The producer side is safe for any number of concurrent producers, so
//! [`Producer`] is `Clone`. The consumer side requires exactly one consumer.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// A slot in the ring buffer with sequence number for synchronization.
#[repr(C)]
#[repr(align(64))] // Each slot on its own cache line to avoid false sharing between producers
struct Slot<T> {
    /// Sequence number for synchronization.
    /// - Initial: slot index (0, 1, 2, ..., N-1)
    /// - After producer write: position + 1 (signals "data ready")
    /// - After consumer read: position + N (signals "slot free")
    seq: AtomicUsize,

    /// The actual data stored in this slot.
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Heap-allocated ring shared between the producers and the consumer.
struct Ring<T> {
    /// Next position to reserve for writing. Producers CAS this.
    head: AtomicUsize,
    /// Next position to read from. Only the consumer advances this.
    tail: AtomicUsize,
    buffer: Box<[Slot<T>]>,
}

// SAFETY: concurrent access is mediated by atomics; slots are protected by
// the sequence-number protocol.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let buffer = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            buffer,
        }
    }

    fn push(&self, item: T) -> Result<(), T> {
        let n = self.buffer.len();
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let slot = &self.buffer[pos % n];

            let seq = slot.seq.load(Ordering::Acquire);

            // Difference between sequence and position; handles wrapping.
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                // Slot is available at this position. Try to reserve it.
                if self
                    .head
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: exclusive write access — the CAS succeeded so
                    // no other producer can claim this slot, and seq == pos
                    // means the consumer has released it.
                    unsafe {
                        (*slot.value.get()).write(item);
                    }
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                // CAS failed: another producer beat us, retry with new head.
            } else if diff < 0 {
                // seq < pos: slot not yet released by the consumer. Full.
                return Err(item);
            }
            // diff > 0: another producer took this position. Retry.
        }
    }

    /// # Safety
    ///
    /// Only one thread may call this (single consumer).
    unsafe fn pop(&self) -> Option<T> {
        let n = self.buffer.len();
        let tail = self.tail.load(Ordering::Relaxed);
        let slot = &self.buffer[tail % n];

        let seq = slot.seq.load(Ordering::Acquire);

        // A slot is ready to read when seq == tail + 1.
        if seq != tail.wrapping_add(1) {
            return None;
        }

        // SAFETY: the sequence check confirms the producer finished writing.
        let item = unsafe { (*slot.value.get()).assume_init_read() };

        // Release the slot for position (tail + N).
        slot.seq.store(tail.wrapping_add(n), Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Relaxed);

        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Drain unread items so their destructors run.
        // SAFETY: &mut self guarantees no other thread holds the ring.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the MPSC queue.
///
/// Cloneable and shareable: any number of threads may push concurrently.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
}

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the MPSC queue.
///
/// Only one consumer may exist per queue — multiple consumers cause data
/// races, so `Consumer` is `Send` but **not** `Sync` and not `Clone`.
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new MPSC channel with the given capacity.
///
/// Returns a `(Producer, Consumer)` pair. Producers can be cloned and sent
/// to any number of threads; the consumer must stay on one.
///
/// # Panics
///
/// Panics if `capacity == 0`.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");

    let ring = Arc::new(Ring::new(capacity));

    let producer = Producer {
        ring: Arc::clone(&ring),
    };

    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Send> Producer<T> {
    /// Attempts to push an item onto the queue (lock-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }

    /// Spins until space is available, then pushes.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    pub fn push_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if let Some(dl) = deadline {
                        if Instant::now() > dl {
                            return Err(item);
                        }
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl<T: Send> Consumer<T> {
    /// Attempts to pop an item from the queue (wait-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: Consumer is neither Sync nor Clone, so this thread has
        // exclusive access to the consumer side of the ring.
        unsafe { self.ring.pop() }
    }
}
