//! The memory-source capability an `Arena` depends on: the two
//! concrete flavors (heap-array-backed vs. off-heap) are expressed as
//! a single `Platform` trait plus two implementations, rather than a
//! type hierarchy. The off-heap half wraps raw mmap/VirtualAlloc
//! primitives; the heap-array half is just a `Vec<u8>`.

use log::warn;

/// A contiguous block of bytes backing one chunk. Implementors own
/// their storage and free it on `Drop`.
pub trait Memory: Send + Sync {
    fn len(&self) -> usize;
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// The capability set an `Arena` needs from its environment: how to
/// obtain and release backing storage, and how to copy between two
/// regions of it. Two implementations are provided: [`HeapPlatform`]
/// (a plain `Vec<u8>` per chunk) and [`DirectPlatform`] (pages mapped
/// straight from the OS, unix via `mmap`/`munmap`, windows via
/// `VirtualAlloc`/`VirtualFree`).
pub trait Platform: Send + Sync {
    type Memory: Memory;

    /// Allocate `size` bytes of fresh backing storage for a pooled chunk.
    fn new_chunk(&self, size: usize) -> Self::Memory;

    /// Allocate backing storage for a one-off unpooled (Huge) chunk.
    /// Identical to `new_chunk` unless the platform wants to treat huge
    /// allocations differently (e.g. skip a cache it keeps for pooled
    /// chunk sizes).
    fn new_unpooled_chunk(&self, size: usize) -> Self::Memory {
        self.new_chunk(size)
    }

    /// Copy `len` bytes from `src[src_off..]` into `dst[dst_off..]`.
    fn memory_copy(&self, src: &Self::Memory, src_off: usize, dst: &mut Self::Memory, dst_off: usize, len: usize) {
        if len == 0 {
            return;
        }
        let src_bytes = &src.as_slice()[src_off..src_off + len];
        dst.as_mut_slice()[dst_off..dst_off + len].copy_from_slice(src_bytes);
    }

    /// Notification that a chunk's backing storage is about to be
    /// dropped. The actual free happens via `Memory`'s `Drop` impl;
    /// this hook exists so a platform can log or update stats at the
    /// point where the free must happen outside the arena guard,
    /// without the core needing to know how freeing actually works.
    fn destroy_chunk(&self, _size: usize) {}

    /// Whether this platform's storage lives outside the managed heap
    /// (relevant only to external reporting, never to core routing).
    fn is_direct(&self) -> bool;
}

/// Backing storage is a plain heap-allocated byte vector.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPlatform;

impl Memory for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn as_slice(&self) -> &[u8] {
        &self[..]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self[..]
    }
}

impl Platform for HeapPlatform {
    type Memory = Vec<u8>;

    fn new_chunk(&self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    fn is_direct(&self) -> bool {
        false
    }
}

/// Backing storage is a region mapped directly from the OS, bypassing
/// the managed heap (the "direct buffer" path).
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectPlatform;

/// A region obtained from the OS. Frees itself via the platform's raw
/// unmap call on `Drop`.
pub struct DirectMemory {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by this value; no other
// handle to the same address range exists once construction returns.
unsafe impl Send for DirectMemory {}
unsafe impl Sync for DirectMemory {}

impl Memory for DirectMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for DirectMemory {
    fn drop(&mut self) {
        if self.ptr.is_null() || self.len == 0 {
            return;
        }
        unsafe { os_mem_free(self.ptr, self.len) };
    }
}

impl Platform for DirectPlatform {
    type Memory = DirectMemory;

    fn new_chunk(&self, size: usize) -> DirectMemory {
        let ptr = unsafe { os_mem_alloc(size) };
        DirectMemory { ptr, len: size }
    }

    fn is_direct(&self) -> bool {
        true
    }
}

#[cfg(unix)]
unsafe fn os_mem_alloc(size: usize) -> *mut u8 {
    let p = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        warn!("mmap failed for size {}: errno {}", size, errno::errno());
        return std::ptr::null_mut();
    }
    p as *mut u8
}

#[cfg(unix)]
unsafe fn os_mem_free(addr: *mut u8, size: usize) {
    if libc::munmap(addr as *mut _, size) != 0 {
        warn!("munmap failed for addr {:p} size {}: errno {}", addr, size, errno::errno());
    }
}

#[cfg(windows)]
unsafe fn os_mem_alloc(size: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    let p = VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
    if p.is_null() {
        warn!("VirtualAlloc failed for size {}", size);
    }
    p as *mut u8
}

#[cfg(windows)]
unsafe fn os_mem_free(addr: *mut u8, _size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    if VirtualFree(addr as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("VirtualFree failed for addr {:p}", addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_platform_allocates_zeroed_memory() {
        let p = HeapPlatform;
        let mem = p.new_chunk(64);
        assert_eq!(mem.len(), 64);
        assert!(mem.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn memory_copy_moves_bytes_between_chunks() {
        let p = HeapPlatform;
        let mut src = p.new_chunk(16);
        src.as_mut_slice()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        let mut dst = p.new_chunk(16);
        p.memory_copy(&src, 0, &mut dst, 8, 4);
        assert_eq!(&dst.as_slice()[8..12], &[1, 2, 3, 4]);
    }

    #[test]
    fn direct_platform_round_trips_bytes() {
        let p = DirectPlatform;
        let mut mem = p.new_chunk(4096);
        mem.as_mut_slice()[10] = 0xAB;
        assert_eq!(mem.as_slice()[10], 0xAB);
        assert!(p.is_direct());
    }
}
