//! FIFO message queues and the interrupt-masking guard.
//!
//! [`Queue`] is a plain FIFO. On the remote core the dispatch loop and the
//! transport interrupt handler share the local dispatch queue, so that queue
//! is wrapped in a [`LocalQueue`] whose operations demand an [`IrqGuard`]:
//! a critical section entered on construction and left on drop, so every
//! mask is paired with its restore.

use core::cell::RefCell;
use core::marker::PhantomData;
use std::collections::VecDeque;

use critical_section::{CriticalSection, RestoreState};

/// Scoped interrupt mask.
///
/// Not `Send`: a critical section must be released by the context that
/// entered it.
pub struct IrqGuard {
    state: RestoreState,
    _not_send: PhantomData<*const ()>,
}

impl IrqGuard {
    /// Mask local interrupts until the guard is dropped.
    pub fn new() -> Self {
        // SAFETY: released exactly once in `Drop`, and guards are dropped in
        // reverse order of creation because they cannot leave this context.
        let state = unsafe { critical_section::acquire() };
        IrqGuard {
            state,
            _not_send: PhantomData,
        }
    }

    /// Token proving interrupts are masked for the guard's lifetime.
    pub fn token(&self) -> CriticalSection<'_> {
        // SAFETY: the critical section is held until `self` is dropped.
        unsafe { CriticalSection::new() }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        // SAFETY: `state` came from the matching `acquire` in `new`.
        unsafe { critical_section::release(self.state) }
    }
}

/// Singly linked FIFO, modelled as a ring of owned items.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
}

impl<T> Queue<T> {
    pub const fn new() -> Self {
        Queue {
            items: VecDeque::new(),
        }
    }

    /// Append to the tail. Returns `true` if the queue was empty, i.e. the
    /// consumer may need a wakeup.
    pub fn enqueue(&mut self, item: T) -> bool {
        let was_empty = self.items.is_empty();
        self.items.push_back(item);
        was_empty
    }

    /// Pop the head.
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn head(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Remove and return every item, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    /// Remove every item matching `pred`, keeping the rest in order.
    pub fn take_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if pred(&item) {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        taken
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Queue`] shared between task and interrupt context.
pub struct LocalQueue<T> {
    inner: critical_section::Mutex<RefCell<Queue<T>>>,
}

impl<T> LocalQueue<T> {
    pub const fn new() -> Self {
        LocalQueue {
            inner: critical_section::Mutex::new(RefCell::new(Queue::new())),
        }
    }

    pub fn enqueue(&self, irq: &IrqGuard, item: T) -> bool {
        self.inner.borrow_ref_mut(irq.token()).enqueue(item)
    }

    pub fn dequeue(&self, irq: &IrqGuard) -> Option<T> {
        self.inner.borrow_ref_mut(irq.token()).dequeue()
    }

    /// Pull every item matching `pred` out of the queue.
    pub fn take_where(&self, irq: &IrqGuard, pred: impl FnMut(&T) -> bool) -> Vec<T> {
        self.inner.borrow_ref_mut(irq.token()).take_where(pred)
    }

    pub fn len(&self, irq: &IrqGuard) -> usize {
        self.inner.borrow_ref(irq.token()).len()
    }

    pub fn is_empty(&self, irq: &IrqGuard) -> bool {
        self.inner.borrow_ref(irq.token()).is_empty()
    }
}

impl<T> Default for LocalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
