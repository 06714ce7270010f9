//! Memory shared between the host and the remote core.
//!
//! The region is split in two heaps. The host heap backs every host-side
//! [`BufferPool`](crate::buffer::BufferPool) and loaded library images; the
//! DSP heap backs buffers the remote core allocates for component-to-component
//! links.
//!
//! ```text
//! offset 0                       size / 2                         size
//! ├──────────── host heap ─────────┼──────────── DSP heap ──────────┤
//! ```
//!
//! Addresses cross the transport as offsets into this region. [`AddressMap`]
//! converts between offsets and addresses in a local address space.

use parking_lot::Mutex;

use crate::constants::{HOST_HEAP_SHARE, SHMEM_ALIGN};
use crate::error::{Error, Result};

/// Translation between local addresses and shared-memory offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMap {
    local_base: usize,
    size: usize,
}

impl AddressMap {
    pub const fn new(local_base: usize, size: usize) -> Self {
        AddressMap { local_base, size }
    }

    /// The remote core's view: offsets are its local addresses.
    pub const fn identity(size: usize) -> Self {
        AddressMap::new(0, size)
    }

    pub fn local_to_shared(&self, local: usize) -> Result<u32> {
        match local.checked_sub(self.local_base) {
            Some(offset) if offset < self.size => Ok(offset as u32),
            _ => Err(Error::BadAddress(local as u64)),
        }
    }

    pub fn shared_to_local(&self, shared: u32) -> Result<usize> {
        let offset = shared as usize;
        if offset < self.size {
            Ok(self.local_base + offset)
        } else {
            Err(Error::BadAddress(shared as u64))
        }
    }

    /// Unchecked form of [`shared_to_local`](Self::shared_to_local) for offsets
    /// already known to lie inside the region.
    pub fn offset_to_local(&self, offset: usize) -> usize {
        debug_assert!(offset < self.size);
        self.local_base + offset
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A contiguous allocation inside the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// First-fit allocator over a fixed range of offsets.
#[derive(Debug)]
pub struct RegionAllocator {
    start: usize,
    end: usize,
    /// Free extents, sorted by offset, never adjacent.
    free: Vec<Region>,
}

impl RegionAllocator {
    pub fn new(start: usize, end: usize) -> Self {
        RegionAllocator {
            start,
            end,
            free: vec![Region {
                offset: start,
                len: end - start,
            }],
        }
    }

    pub fn alloc(&mut self, size: usize) -> Result<Region> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation"));
        }
        let len = size.checked_next_multiple_of(SHMEM_ALIGN).ok_or(Error::OutOfMemory)?;
        let pos = self
            .free
            .iter()
            .position(|r| r.len >= len)
            .ok_or(Error::OutOfMemory)?;
        let hole = &mut self.free[pos];
        let region = Region {
            offset: hole.offset,
            len,
        };
        hole.offset += len;
        hole.len -= len;
        if hole.len == 0 {
            self.free.remove(pos);
        }
        Ok(region)
    }

    pub fn free(&mut self, region: Region) -> Result<()> {
        if region.offset < self.start || region.end() > self.end {
            return Err(Error::BadAddress(region.offset as u64));
        }
        let pos = self.free.partition_point(|r| r.offset < region.offset);
        let overlaps_prev = pos > 0 && self.free[pos - 1].end() > region.offset;
        let overlaps_next = pos < self.free.len() && region.end() > self.free[pos].offset;
        if overlaps_prev || overlaps_next {
            return Err(Error::InvalidState("region freed twice"));
        }
        self.free.insert(pos, region);
        // coalesce with the following extent, then with the preceding one
        if pos + 1 < self.free.len() && self.free[pos].end() == self.free[pos + 1].offset {
            self.free[pos].len += self.free[pos + 1].len;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].end() == self.free[pos].offset {
            self.free[pos - 1].len += self.free[pos].len;
            self.free.remove(pos);
        }
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.free.iter().map(|r| r.len).sum()
    }

    pub fn capacity(&self) -> usize {
        self.end - self.start
    }
}

/// Which side of the region an allocation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heap {
    Host,
    Dsp,
}

/// The shared region itself.
pub struct SharedMemory {
    storage: Mutex<Box<[u8]>>,
    /// Process address of byte 0; used for translation only, never dereferenced.
    base: usize,
    size: usize,
    host_heap: Mutex<RegionAllocator>,
    dsp_heap: Mutex<RegionAllocator>,
}

impl SharedMemory {
    pub fn new(size: usize) -> Result<Self> {
        if size < 2 * SHMEM_ALIGN {
            return Err(Error::InvalidArgument("shared memory too small"));
        }
        let storage = vec![0u8; size].into_boxed_slice();
        let base = storage.as_ptr() as usize;
        let split = (size / HOST_HEAP_SHARE) / SHMEM_ALIGN * SHMEM_ALIGN;
        log::debug!("shared memory: {size} bytes, host heap {split}, dsp heap {}", size - split);
        Ok(SharedMemory {
            storage: Mutex::new(storage),
            base,
            size,
            host_heap: Mutex::new(RegionAllocator::new(0, split)),
            dsp_heap: Mutex::new(RegionAllocator::new(split, size)),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Translation for host-side (process) addresses.
    pub fn host_map(&self) -> AddressMap {
        AddressMap::new(self.base, self.size)
    }

    pub fn alloc(&self, heap: Heap, size: usize) -> Result<Region> {
        self.heap(heap).lock().alloc(size)
    }

    pub fn free(&self, heap: Heap, region: Region) -> Result<()> {
        self.heap(heap).lock().free(region)
    }

    pub fn available(&self, heap: Heap) -> usize {
        self.heap(heap).lock().available()
    }

    fn heap(&self, heap: Heap) -> &Mutex<RegionAllocator> {
        match heap {
            Heap::Host => &self.host_heap,
            Heap::Dsp => &self.dsp_heap,
        }
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::BadAddress(offset as u64)),
        }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        out.copy_from_slice(&self.storage.lock()[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.storage.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check(offset, len)?;
        self.storage.lock()[offset..offset + len].fill(value);
        Ok(())
    }

    /// Copy `len` bytes between two offsets under one lock.
    pub fn copy(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.check(src, len)?;
        self.check(dst, len)?;
        self.storage.lock().copy_within(src..src + len, dst);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl core::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_is_bounded() {
        let map = AddressMap::new(0x8000, 0x100);
        assert_eq!(map.local_to_shared(0x8000).unwrap(), 0);
        assert_eq!(map.local_to_shared(0x80FF).unwrap(), 0xFF);
        assert!(matches!(map.local_to_shared(0x8100), Err(Error::BadAddress(0x8100))));
        assert!(matches!(map.local_to_shared(0x7FFF), Err(Error::BadAddress(_))));
        assert_eq!(map.shared_to_local(0x10).unwrap(), 0x8010);
        assert!(matches!(map.shared_to_local(0x100), Err(Error::BadAddress(0x100))));
    }

    #[test]
    fn allocator_first_fit_and_exhaustion() {
        let mut heap = RegionAllocator::new(0, 4 * SHMEM_ALIGN);
        let a = heap.alloc(1).unwrap();
        let b = heap.alloc(SHMEM_ALIGN + 1).unwrap();
        assert_eq!(a, Region { offset: 0, len: SHMEM_ALIGN });
        assert_eq!(b.offset, SHMEM_ALIGN);
        assert_eq!(b.len, 2 * SHMEM_ALIGN);
        assert_eq!(heap.available(), SHMEM_ALIGN);
        assert!(matches!(heap.alloc(2 * SHMEM_ALIGN), Err(Error::OutOfMemory)));
    }

    #[test]
    fn allocator_coalesces_on_free() {
        let mut heap = RegionAllocator::new(0, 3 * SHMEM_ALIGN);
        let a = heap.alloc(SHMEM_ALIGN).unwrap();
        let b = heap.alloc(SHMEM_ALIGN).unwrap();
        let c = heap.alloc(SHMEM_ALIGN).unwrap();
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.available(), heap.capacity());
        // whole range is one extent again
        assert_eq!(heap.alloc(3 * SHMEM_ALIGN).unwrap().offset, 0);
    }

    #[test]
    fn allocator_rejects_double_free() {
        let mut heap = RegionAllocator::new(0, 2 * SHMEM_ALIGN);
        let a = heap.alloc(SHMEM_ALIGN).unwrap();
        heap.free(a).unwrap();
        assert!(matches!(heap.free(a), Err(Error::InvalidState(_))));
    }

    #[test]
    fn heaps_do_not_overlap() {
        let shm = SharedMemory::new(8 * SHMEM_ALIGN).unwrap();
        let h = shm.alloc(Heap::Host, 4 * SHMEM_ALIGN).unwrap();
        let d = shm.alloc(Heap::Dsp, 4 * SHMEM_ALIGN).unwrap();
        assert!(h.end() <= d.offset);
        assert!(matches!(shm.alloc(Heap::Host, 1), Err(Error::OutOfMemory)));
    }

    #[test]
    fn bounded_byte_access() {
        let shm = SharedMemory::new(256).unwrap();
        shm.write(10, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        shm.read(10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        shm.copy(10, 100, 3).unwrap();
        shm.read(100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        shm.write_u32(200, 0xDEAD_BEEF).unwrap();
        assert_eq!(shm.read_u32(200).unwrap(), 0xDEAD_BEEF);
        assert!(shm.write(255, &[0, 0]).is_err());
        assert!(shm.read(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn host_map_covers_region() {
        let shm = SharedMemory::new(256).unwrap();
        let map = shm.host_map();
        let local = map.shared_to_local(17).unwrap();
        assert_eq!(map.local_to_shared(local).unwrap(), 17);
    }
}
