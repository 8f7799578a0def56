//! Kernel buffer objects and CPU mappings of them.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::flags::Placement;

/// Kernel-side name of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A kernel buffer object as seen from user space.
///
/// Shared between every wrapper that sub-allocates from or imports it. The
/// offset and flags are the values the kernel last reported; they change
/// only after a submission moves the buffer.
#[derive(Debug)]
pub struct KernelBo {
    handle: BufferHandle,
    size: u64,
    offset: AtomicU64,
    flags: AtomicU64,
}

impl KernelBo {
    /// Describe a kernel buffer.
    pub fn new(handle: BufferHandle, size: u64, offset: u64, flags: Placement) -> Self {
        Self {
            handle,
            size,
            offset: AtomicU64::new(offset),
            flags: AtomicU64::new(flags.bits()),
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last known GPU offset.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Last known placement.
    pub fn flags(&self) -> Placement {
        Placement::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Record a new offset and placement. Returns the previous pair.
    pub fn update(&self, offset: u64, flags: Placement) -> (u64, Placement) {
        let old_offset = self.offset.swap(offset, Ordering::AcqRel);
        let old_flags = self.flags.swap(flags.bits(), Ordering::AcqRel);
        (old_offset, Placement::from_bits_retain(old_flags))
    }
}

/// A CPU-visible view of (part of) a mapped buffer.
///
/// The mapping does not own the memory. It stays valid until the buffer it
/// came from is unmapped, which the owner of the map tracks.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a mapping is an address range; synchronizing accesses through it is
// the job of the buffer's map/unmap bracket and its fences.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Wrap a raw mapped range.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the mapping (or any narrowed copy of it) is used.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Narrow the mapping to `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Mapping> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset is within the mapped range checked above.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Some(Mapping { ptr, len })
    }

    /// Copy `data` into the mapping at `offset`.
    ///
    /// # Safety
    ///
    /// The mapping must still be live and no other thread may access the
    /// written range concurrently.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.len,
            "write of {} bytes at {offset} past mapping of {}",
            data.len(),
            self.len
        );
        // SAFETY: bounds checked above, liveness guaranteed by the caller.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len()) }
    }

    /// Copy bytes starting at `offset` into `out`.
    ///
    /// # Safety
    ///
    /// The mapping must still be live and no other thread may write the
    /// read range concurrently.
    pub unsafe fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(
            offset + out.len() <= self.len,
            "read of {} bytes at {offset} past mapping of {}",
            out.len(),
            self.len
        );
        // SAFETY: bounds checked above, liveness guaranteed by the caller.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len()) }
    }

    /// Store a little-endian dword at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Mapping::write`].
    pub unsafe fn write_u32(&self, offset: usize, value: u32) {
        // SAFETY: forwarded contract.
        unsafe { self.write(offset, &value.to_le_bytes()) }
    }

    /// Load a little-endian dword from `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Mapping::read`].
    pub unsafe fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        // SAFETY: forwarded contract.
        unsafe { self.read(offset, &mut bytes) };
        u32::from_le_bytes(bytes)
    }
}

/// Zeroed host memory at a fixed address, handed out as [`Mapping`]s.
pub struct HostAllocation {
    ptr: NonNull<[u8]>,
}

// SAFETY: a plain heap allocation with no thread affinity.
unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        Self {
            ptr: NonNull::from(Box::leak(boxed)),
        }
    }

    pub fn len(&self) -> usize {
        self.ptr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A mapping of the whole allocation. It dangles once `self` drops.
    pub fn mapping(&self) -> Mapping {
        // SAFETY: valid for `len` bytes until `Drop`.
        unsafe { Mapping::from_raw_parts(self.ptr.cast(), self.len()) }
    }
}

impl fmt::Debug for HostAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAllocation").field("len", &self.len()).finish()
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Box::leak` in `zeroed` and is dropped once.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping_of(storage: &mut [u8]) -> Mapping {
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        unsafe { Mapping::from_raw_parts(ptr, storage.len()) }
    }

    #[test]
    fn test_kernel_bo_update_returns_previous() {
        let bo = KernelBo::new(BufferHandle(3), 4096, 0x1000, Placement::MEM_LOCAL);
        let (offset, flags) = bo.update(0x8000, Placement::MEM_TT);
        assert_eq!(offset, 0x1000);
        assert_eq!(flags, Placement::MEM_LOCAL);
        assert_eq!(bo.offset(), 0x8000);
        assert_eq!(bo.flags(), Placement::MEM_TT);
    }

    #[test]
    fn test_slice_bounds() {
        let mut storage = vec![0u8; 64];
        let mapping = mapping_of(&mut storage);
        assert!(mapping.slice(32, 32).is_some());
        assert!(mapping.slice(33, 32).is_none());
        assert!(mapping.slice(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_slice_writes_land_at_offset() {
        let mut storage = vec![0u8; 16];
        let mapping = mapping_of(&mut storage);
        let sub = mapping.slice(8, 8).unwrap();
        unsafe { sub.write_u32(0, 0xdead_beef) };
        assert_eq!(unsafe { mapping.read_u32(8) }, 0xdead_beef);
        assert_eq!(&storage[8..12], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    fn test_host_allocation_is_zeroed_and_stable() {
        let host = HostAllocation::zeroed(32);
        let first = host.mapping();
        unsafe { first.write(0, &[7; 4]) };
        let second = host.mapping();
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(unsafe { second.read_u32(0) }, 0x0707_0707);
        assert_eq!(unsafe { second.read_u32(28) }, 0);
    }

    #[test]
    #[should_panic(expected = "past mapping")]
    fn test_write_out_of_bounds_panics() {
        let mut storage = vec![0u8; 4];
        let mapping = mapping_of(&mut storage);
        unsafe { mapping.write(2, &[1, 2, 3]) };
    }
}
