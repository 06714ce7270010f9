//! Lock-free single-producer single-consumer ring of wire records.
//!
//! One vring carries messages in one direction between the host and the
//! remote core. The producer and the consumer may run concurrently; each
//! side only advances its own index.
//!
//! # Safety Contract
//!
//! - Only ONE context may call [`push()`](Vring::push) at a time (the "producer").
//! - Only ONE context may call [`pop()`](Vring::pop) at a time (the "consumer").
//!
//! Callers with several producer threads serialise them with a lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::message::WireMessage;

/// Ring of `N` record slots. Usable capacity is `N - 1` (Lamport queue).
pub struct Vring<const N: usize> {
    slots: [UnsafeCell<WireMessage>; N],
    /// Next slot to write (only modified by the producer).
    head: AtomicUsize,
    /// Next slot to read (only modified by the consumer).
    tail: AtomicUsize,
}

// SAFETY: the SPSC contract means `head` and `tail` each have one writer,
// and a slot is only touched by the side that currently owns it as decided
// by the acquire/release handoff of those indices. `WireMessage` is `Copy`.
unsafe impl<const N: usize> Sync for Vring<N> {}
unsafe impl<const N: usize> Send for Vring<N> {}

impl<const N: usize> Vring<N> {
    pub fn new() -> Self {
        assert!(N >= 2, "vring needs at least 2 slots (1 usable)");
        Vring {
            slots: core::array::from_fn(|_| UnsafeCell::new(WireMessage::default())),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Returns the record back if the ring is full.
    pub fn push(&self, record: WireMessage) -> Result<(), WireMessage> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % N;
        if next == self.tail.load(Ordering::Acquire) {
            return Err(record);
        }
        // SAFETY: sole producer; `next != tail` means the consumer is not
        // reading this slot.
        unsafe {
            *self.slots[head].get() = record;
        }
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side. `None` when empty.
    pub fn pop(&self) -> Option<WireMessage> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: sole consumer; `tail != head` means the slot holds a
        // record published by the producer.
        let record = unsafe { *self.slots[tail].get() };
        self.tail.store((tail + 1) % N, Ordering::Release);
        Some(record)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + N - tail) % N
    }

    pub const fn capacity(&self) -> usize {
        N - 1
    }
}

impl<const N: usize> Default for Vring<N> {
    fn default() -> Self {
        Self::new()
    }
}
