//! Fixed pool of message slots for the remote core.
//!
//! Slots live in an arena carved out of the core's local scratch memory at
//! start-up. A [`MsgHandle`] names one slot; it is not `Clone`, so a slot is
//! held by exactly one queue or port at a time.

use crate::constants::MSG_SLOT_SIZE;
use crate::error::{Error, Result};
use crate::message::{Message, MsgId};
use crate::opcode::Opcode;

use std::sync::atomic::{AtomicU32, Ordering};

/// Bump allocator over the remote core's local (non-shared) memory.
#[derive(Debug)]
pub struct LocalHeap {
    capacity: usize,
    used: usize,
}

impl LocalHeap {
    pub const fn new(capacity: usize) -> Self {
        LocalHeap { capacity, used: 0 }
    }

    /// Reserve `size` bytes aligned to `align`, returning their offset.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<usize> {
        let start = self.used.next_multiple_of(align.max(1));
        let end = start.checked_add(size).ok_or(Error::OutOfMemory)?;
        if end > self.capacity {
            return Err(Error::OutOfMemory);
        }
        self.used = end;
        Ok(start)
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }
}

static NEXT_POOL_TAG: AtomicU32 = AtomicU32::new(1);

/// Handle to one checked-out message slot.
#[derive(Debug, PartialEq, Eq)]
pub struct MsgHandle {
    tag: u32,
    index: u16,
}

impl MsgHandle {
    pub fn index(&self) -> u16 {
        self.index
    }
}

pub struct MessagePool {
    tag: u32,
    slots: Vec<Message>,
    in_use: Vec<bool>,
    /// Stack of free slot indices.
    free: Vec<u16>,
}

impl MessagePool {
    /// Carve `n` slots out of `heap` and put them all on the free list.
    pub fn init(n: usize, heap: &mut LocalHeap) -> Result<Self> {
        if n == 0 || n > u16::MAX as usize {
            return Err(Error::InvalidArgument("message pool size"));
        }
        let bytes = n.checked_mul(MSG_SLOT_SIZE).ok_or(Error::OutOfMemory)?;
        heap.alloc(bytes, 8)?;
        let blank = Message::new(MsgId::unpack(0), Opcode::Flush, None, 0);
        Ok(MessagePool {
            tag: NEXT_POOL_TAG.fetch_add(1, Ordering::Relaxed),
            slots: vec![blank; n],
            in_use: vec![false; n],
            free: (0..n as u16).rev().collect(),
        })
    }

    /// Pop a free slot.
    ///
    /// Exhaustion means more messages are in flight than the protocol
    /// allows; callers treat it as a hard error.
    pub fn get(&mut self) -> Result<MsgHandle> {
        let index = self.free.pop().ok_or(Error::ExhaustedPool)?;
        self.in_use[index as usize] = true;
        Ok(MsgHandle {
            tag: self.tag,
            index,
        })
    }

    /// Pop a free slot and fill it with `msg`.
    pub fn alloc(&mut self, msg: Message) -> Result<MsgHandle> {
        let handle = self.get()?;
        self.slots[handle.index as usize] = msg;
        Ok(handle)
    }

    /// Return a slot. Foreign or already-free handles are reported as corruption.
    pub fn put(&mut self, handle: MsgHandle) -> Result<()> {
        let index = handle.index as usize;
        if handle.tag != self.tag || index >= self.slots.len() {
            log::error!("message {handle:?} does not belong to pool {}", self.tag);
            return Err(Error::InvalidState("message not from this pool"));
        }
        if !self.in_use[index] {
            log::error!("message slot {index} returned twice");
            return Err(Error::InvalidState("message returned twice"));
        }
        self.in_use[index] = false;
        self.free.push(handle.index);
        Ok(())
    }

    pub fn msg(&self, handle: &MsgHandle) -> &Message {
        debug_assert_eq!(handle.tag, self.tag);
        &self.slots[handle.index as usize]
    }

    pub fn msg_mut(&mut self, handle: &MsgHandle) -> &mut Message {
        debug_assert_eq!(handle.tag, self.tag);
        &mut self.slots[handle.index as usize]
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
