use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::POOL_ITEM_HEADER;
use crate::error::{Error, Result};
use crate::shmem::{Heap, Region, SharedMemory};

use super::handle::Buffer;

/// What the buffers of a pool are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    /// Control-command payloads.
    Aux,
    /// Data fed into a component's input port.
    Input,
    /// Data produced on a component's output port.
    Output,
}

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Fixed-capacity slab of equally sized buffers in the host heap.
///
/// Storage for all `count` items is reserved up front. Each item is laid
/// out as an 8-byte header (pool id, item index) followed by `item_size`
/// data bytes. [`get()`](Self::get) and [`put()`](Self::put) only move item
/// indices between the free stack and their holders.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    id: u32,
    role: PoolRole,
    count: usize,
    item_size: usize,
    stride: usize,
    region: Region,
    shm: Arc<SharedMemory>,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Stack of free item indices.
    free: Vec<u32>,
    released: bool,
}

impl BufferPool {
    /// Reserve `count * item_size` bytes (plus item headers) from the host heap.
    pub fn alloc(
        shm: &Arc<SharedMemory>,
        count: usize,
        item_size: usize,
        role: PoolRole,
    ) -> Result<Self> {
        if count == 0 || item_size == 0 || count > u32::MAX as usize {
            return Err(Error::InvalidArgument("pool geometry"));
        }
        let stride = (POOL_ITEM_HEADER + item_size).next_multiple_of(POOL_ITEM_HEADER);
        let bytes = count.checked_mul(stride).ok_or(Error::OutOfMemory)?;
        let region = shm.alloc(Heap::Host, bytes)?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        for index in 0..count {
            let header = region.offset + index * stride;
            shm.write_u32(header, id)?;
            shm.write_u32(header + 4, index as u32)?;
        }

        log::debug!(
            "pool {id} ({role:?}): {count} x {item_size} bytes at {:#x}",
            region.offset
        );

        Ok(BufferPool {
            shared: Arc::new(PoolShared {
                id,
                role,
                count,
                item_size,
                stride,
                region,
                shm: shm.clone(),
                state: Mutex::new(PoolState {
                    // reversed so that the first `get` hands out item 0
                    free: (0..count as u32).rev().collect(),
                    released: false,
                }),
            }),
        })
    }

    /// Check out one buffer. Never blocks and never grows the pool.
    pub fn get(&self) -> Result<Buffer> {
        let mut state = self.shared.state.lock();
        if state.released {
            return Err(Error::InvalidState("pool has been freed"));
        }
        let index = state.free.pop().ok_or(Error::ExhaustedPool)?;
        Ok(Buffer::new(self.shared.clone(), index))
    }

    /// Return a buffer to this pool.
    ///
    /// # Panics
    ///
    /// If `buffer` was not checked out from this pool.
    pub fn put(&self, buffer: Buffer) {
        assert!(
            self.owns(&buffer),
            "buffer {} of pool {} returned to pool {}",
            buffer.index(),
            buffer.pool_id(),
            self.shared.id
        );
        drop(buffer);
    }

    /// Pool-membership check: same pool instance and an intact item header.
    pub fn owns(&self, buffer: &Buffer) -> bool {
        Arc::ptr_eq(&self.shared, buffer.pool()) && self.shared.header_matches(buffer.index())
    }

    /// Release the backing storage.
    ///
    /// Fails with `InvalidState` while any buffer is checked out, or if the
    /// pool was already freed.
    pub fn free(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.released {
            return Err(Error::InvalidState("pool already freed"));
        }
        if state.free.len() != self.shared.count {
            log::warn!(
                "pool {}: {} buffers still checked out",
                self.shared.id,
                self.shared.count - state.free.len()
            );
            return Err(Error::InvalidState("buffers still checked out"));
        }
        self.shared.shm.free(Heap::Host, self.shared.region)?;
        state.released = true;
        log::debug!("pool {} freed", self.shared.id);
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn role(&self) -> PoolRole {
        self.shared.role
    }

    pub fn capacity(&self) -> usize {
        self.shared.count
    }

    pub fn item_size(&self) -> usize {
        self.shared.item_size
    }

    /// Number of buffers currently in the free list.
    pub fn available(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn is_freed(&self) -> bool {
        self.shared.state.lock().released
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("count", &self.shared.count)
            .field("item_size", &self.shared.item_size)
            .finish()
    }
}

impl PoolShared {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn role(&self) -> PoolRole {
        self.role
    }

    pub(crate) fn item_size(&self) -> usize {
        self.item_size
    }

    pub(crate) fn shm(&self) -> &Arc<SharedMemory> {
        &self.shm
    }

    /// Shared-memory offset of the data bytes of item `index`.
    pub(crate) fn data_offset(&self, index: u32) -> usize {
        self.region.offset + index as usize * self.stride + POOL_ITEM_HEADER
    }

    fn header_matches(&self, index: u32) -> bool {
        let header = self.region.offset + index as usize * self.stride;
        (index as usize) < self.count
            && self.shm.read_u32(header).ok() == Some(self.id)
            && self.shm.read_u32(header + 4).ok() == Some(index)
    }

    /// Push a returned item back onto the free stack.
    pub(crate) fn release(&self, index: u32) {
        let mut state = self.state.lock();
        debug_assert!(!state.free.contains(&index), "buffer {index} returned twice");
        state.free.push(index);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // Last reference gone: reclaim storage the owner never freed explicitly.
        if !self.state.get_mut().released {
            if let Err(e) = self.shm.free(Heap::Host, self.region) {
                log::warn!("pool {}: storage not reclaimed: {e}", self.id);
            }
        }
    }
}
