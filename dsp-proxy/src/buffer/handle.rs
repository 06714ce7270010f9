use std::sync::Arc;

use crate::error::{Error, Result};

use super::pool::{PoolRole, PoolShared};

/// Exclusive handle to one checked-out pool item.
///
/// There is exactly one `Buffer` per checked-out item. Dropping it pushes
/// the item back onto its pool's free stack, so an item is always either
/// free or held.
pub struct Buffer {
    pool: Arc<PoolShared>,
    index: u32,
}

impl Buffer {
    pub(crate) fn new(pool: Arc<PoolShared>, index: u32) -> Self {
        Buffer { pool, index }
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn pool_id(&self) -> u32 {
        self.pool.id()
    }

    pub fn role(&self) -> PoolRole {
        self.pool.role()
    }

    /// Process-local address of the first data byte.
    pub fn data(&self) -> usize {
        self.pool.shm().host_map().offset_to_local(self.shared_offset())
    }

    /// Offset of the first data byte inside shared memory.
    pub fn shared_offset(&self) -> usize {
        self.pool.data_offset(self.index)
    }

    /// Capacity in bytes.
    pub fn length(&self) -> usize {
        self.pool.item_size()
    }

    /// Copy `data` into the buffer starting at byte `at`.
    pub fn write(&self, at: usize, data: &[u8]) -> Result<()> {
        self.bounds(at, data.len())?;
        self.pool.shm().write(self.shared_offset() + at, data)
    }

    /// Copy bytes out of the buffer starting at byte `at`.
    pub fn read(&self, at: usize, out: &mut [u8]) -> Result<()> {
        self.bounds(at, out.len())?;
        self.pool.shm().read(self.shared_offset() + at, out)
    }

    pub fn zero(&self) -> Result<()> {
        self.pool.shm().fill(self.shared_offset(), self.length(), 0)
    }

    /// Contents of the first `len` bytes.
    pub fn to_vec(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(0, &mut out)?;
        Ok(out)
    }

    fn bounds(&self, at: usize, len: usize) -> Result<()> {
        match at.checked_add(len) {
            Some(end) if end <= self.length() => Ok(()),
            _ => Err(Error::InvalidArgument("access past end of buffer")),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("pool", &self.pool.id())
            .field("index", &self.index)
            .field("offset", &format_args!("{:#x}", self.shared_offset()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::pool::BufferPool;
    use super::*;
    use crate::shmem::SharedMemory;

    fn pool(count: usize, size: usize) -> BufferPool {
        let shm = Arc::new(SharedMemory::new(16 * 1024).unwrap());
        BufferPool::alloc(&shm, count, size, PoolRole::Input).unwrap()
    }

    #[test]
    fn write_and_read() {
        let pool = pool(2, 128);
        let b = pool.get().unwrap();
        b.write(0, &[1, 2, 3, 4]).unwrap();
        b.write(124, &[9, 9, 9, 9]).unwrap();
        assert_eq!(b.to_vec(4).unwrap(), vec![1, 2, 3, 4]);
        let mut tail = [0u8; 4];
        b.read(124, &mut tail).unwrap();
        assert_eq!(tail, [9; 4]);
    }

    #[test]
    fn access_is_bounded_by_item_size() {
        let pool = pool(2, 16);
        let b = pool.get().unwrap();
        assert!(b.write(15, &[0, 0]).is_err());
        assert!(b.read(17, &mut []).is_err());
        // neighbouring item is untouched by a full-size write
        let c = pool.get().unwrap();
        c.write(0, &[7; 16]).unwrap();
        b.write(0, &[1; 16]).unwrap();
        assert_eq!(c.to_vec(16).unwrap(), vec![7; 16]);
    }

    #[test]
    fn data_address_translates_back() {
        let pool = pool(1, 32);
        let b = pool.get().unwrap();
        let map = b.pool().shm().host_map();
        assert_eq!(map.local_to_shared(b.data()).unwrap() as usize, b.shared_offset());
        assert_eq!(b.length(), 32);
        assert_eq!(b.role(), PoolRole::Input);
    }

    #[test]
    fn zero_clears_contents() {
        let pool = pool(1, 8);
        let b = pool.get().unwrap();
        b.write(0, &[0xFF; 8]).unwrap();
        b.zero().unwrap();
        assert_eq!(b.to_vec(8).unwrap(), vec![0; 8]);
    }
}
