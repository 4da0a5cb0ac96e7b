//! The buddy-tree page allocator over one chunk's backing memory,
//! plus the `ChunkSlab` that owns chunks by stable index rather than
//! by pointer, so chunk-list rings can hold plain indices instead of
//! chasing a pointer-linked tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::handle::Handle;
use crate::platform::Memory;
use crate::subpage::{FreeTransition, Subpage};

/// A node value meaning "this subtree is entirely allocated".
fn unusable(max_order: u32) -> u8 {
    (max_order + 1) as u8
}

fn depth_of(idx: u32) -> u8 {
    debug_assert!(idx >= 1);
    (31 - idx.leading_zeros()) as u8
}

/// A contiguous region of backing memory managed as a complete binary
/// buddy tree over fixed-size pages, optionally subdividing individual
/// leaf pages into [`Subpage`] slots.
pub struct Chunk<M: Memory> {
    memory: M,
    page_size: usize,
    page_shifts: u32,
    max_order: u32,
    chunk_size: usize,
    memory_map: Vec<u8>,
    free_bytes: AtomicUsize,
    subpages: HashMap<u32, Subpage>,
    unpooled: bool,
    /// The `ChunkList` band this chunk currently lives in, updated on
    /// every migration. `None` for an unpooled chunk.
    band: Option<crate::chunk_list::Band>,
}

impl<M: Memory> Chunk<M> {
    pub fn new(memory: M, page_size: usize, page_shifts: u32, max_order: u32) -> Self {
        let page_count = 1usize << max_order;
        let chunk_size = page_size << max_order;
        debug_assert_eq!(memory.len(), chunk_size);
        let mut memory_map = vec![0u8; 2 * page_count];
        for i in 1..2 * page_count {
            memory_map[i] = depth_of(i as u32);
        }
        Chunk {
            memory,
            page_size,
            page_shifts,
            max_order,
            chunk_size,
            memory_map,
            free_bytes: AtomicUsize::new(chunk_size),
            subpages: HashMap::new(),
            unpooled: false,
            band: None,
        }
    }

    /// Wrap an already fully-allocated region for a one-off Huge
    /// request. Never pooled, never split.
    pub fn new_unpooled(memory: M, page_size: usize, page_shifts: u32) -> Self {
        let size = memory.len();
        Chunk {
            memory,
            page_size,
            page_shifts,
            max_order: 0,
            chunk_size: size,
            memory_map: Vec::new(),
            free_bytes: AtomicUsize::new(0),
            subpages: HashMap::new(),
            unpooled: true,
            band: None,
        }
    }

    pub fn is_unpooled(&self) -> bool {
        self.unpooled
    }

    pub fn band(&self) -> Option<crate::chunk_list::Band> {
        self.band
    }

    pub fn set_band(&mut self, band: Option<crate::chunk_list::Band>) {
        self.band = band;
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    /// `100 * (chunk_size - free_bytes) / chunk_size`.
    pub fn usage_percent(&self) -> u32 {
        let free = self.free_bytes() as u64;
        (100 * (self.chunk_size as u64 - free) / self.chunk_size as u64) as u32
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    fn depth_for_pages(&self, pages: usize) -> u8 {
        debug_assert!(pages.is_power_of_two());
        (self.max_order - pages.trailing_zeros()) as u8
    }

    /// Find and claim a free node at exactly depth `d`: descend
    /// choosing the child whose value is `<= d` (left first), mark
    /// the node unusable, and propagate `max(left, right)` upward.
    fn alloc_node(&mut self, d: u8) -> Option<u32> {
        if self.memory_map[1] > d {
            return None;
        }
        let mut id: u32 = 1;
        let mut cur_depth = depth_of(id);
        while cur_depth < d {
            let left = id << 1;
            let left_val = self.memory_map[left as usize];
            id = if left_val <= d { left } else { left | 1 };
            cur_depth += 1;
        }
        debug_assert_eq!(self.memory_map[id as usize], d, "buddy tree invariant violated");
        self.memory_map[id as usize] = unusable(self.max_order);
        self.update_parents_alloc(id);
        Some(id)
    }

    fn update_parents_alloc(&mut self, idx: u32) {
        let mut id = idx;
        while id > 1 {
            let parent = id >> 1;
            let left = parent << 1;
            let right = left | 1;
            let merged = self.memory_map[left as usize].max(self.memory_map[right as usize]);
            self.memory_map[parent as usize] = merged;
            id = parent;
        }
    }

    fn free_node(&mut self, idx: u32) {
        self.memory_map[idx as usize] = depth_of(idx);
        let mut id = idx;
        while id > 1 {
            let parent = id >> 1;
            let left = parent << 1;
            let right = left | 1;
            let left_val = self.memory_map[left as usize];
            let right_val = self.memory_map[right as usize];
            let both_free = left_val == depth_of(left) && right_val == depth_of(right);
            self.memory_map[parent as usize] = if both_free {
                depth_of(parent)
            } else {
                left_val.min(right_val)
            };
            id = parent;
        }
    }

    fn node_byte_range(&self, idx: u32) -> (usize, usize) {
        let depth = depth_of(idx);
        let span_pages = 1usize << (self.max_order - depth as u32);
        let first_at_depth = 1u32 << depth;
        let offset_pages = (idx - first_at_depth) as usize * span_pages;
        (offset_pages * self.page_size, span_pages * self.page_size)
    }

    /// Allocate a whole page-run of `norm_capacity` bytes (a power of
    /// two, `>= page_size`). Returns `None` if no run that large fits.
    pub fn allocate_run(&mut self, norm_capacity: usize) -> Option<Handle> {
        debug_assert!(norm_capacity >= self.page_size);
        let pages = norm_capacity / self.page_size;
        let d = self.depth_for_pages(pages.next_power_of_two());
        let idx = self.alloc_node(d)?;
        self.free_bytes.fetch_sub(norm_capacity, Ordering::Relaxed);
        Some(Handle::run(idx))
    }

    pub fn free_run(&mut self, handle: Handle, norm_capacity: usize) {
        debug_assert!(!handle.is_subpage());
        self.free_node(handle.memory_map_idx());
        self.free_bytes.fetch_add(norm_capacity, Ordering::Relaxed);
    }

    /// Claim one fresh leaf page and carve it into `elem_size` slots,
    /// returning the first allocated slot. Called only when the
    /// arena's size-class ring had no subpage with room.
    pub fn allocate_subpage(&mut self, elem_size: usize) -> Option<Handle> {
        let leaf = self.alloc_node(self.max_order as u8)?;
        let mut subpage = Subpage::new(self.page_size, elem_size);
        let bitmap_idx = subpage.allocate();
        self.subpages.insert(leaf, subpage);
        self.free_bytes.fetch_sub(elem_size, Ordering::Relaxed);
        Some(Handle::subpage(leaf, bitmap_idx))
    }

    /// Allocate a further slot from a leaf page that is already carved
    /// up (used when the caller already knows which chunk's subpage it
    /// wants, bypassing the ring — see `Arena::free` re-donating a
    /// slot that is about to be handed straight back out).
    pub fn allocate_subpage_slot(&mut self, leaf: u32, elem_size: usize) -> Option<Handle> {
        let subpage = self.subpages.get_mut(&leaf)?;
        if !subpage.has_room() {
            return None;
        }
        let bitmap_idx = subpage.allocate();
        self.free_bytes.fetch_sub(elem_size, Ordering::Relaxed);
        Some(Handle::subpage(leaf, bitmap_idx))
    }

    /// Free a subpage slot. Returns the ring-membership transition the
    /// caller (holding the size-class ring guard) must act on.
    pub fn free_subpage(&mut self, handle: Handle, elem_size: usize) -> FreeTransition {
        debug_assert!(handle.is_subpage());
        let leaf = handle.memory_map_idx();
        let transition = {
            let subpage = self
                .subpages
                .get_mut(&leaf)
                .expect("free_subpage called with a handle from a different chunk");
            subpage.free(handle.bitmap_idx())
        };
        self.free_bytes.fetch_add(elem_size, Ordering::Relaxed);
        transition
    }

    /// Release a leaf page whose subpage became fully free and was
    /// evicted from its ring. The caller must already have removed the
    /// subpage from the size-class ring before calling this.
    pub fn release_subpage(&mut self, leaf: u32) {
        self.subpages.remove(&leaf);
        self.free_node(leaf);
    }

    pub fn subpage_elem_size(&self, leaf: u32) -> Option<usize> {
        self.subpages.get(&leaf).map(|s| s.elem_size)
    }

    pub fn subpage_has_room(&self, leaf: u32) -> bool {
        self.subpages.get(&leaf).is_some_and(|s| s.has_room())
    }

    /// Byte offset and length within this chunk's backing memory for
    /// an outstanding handle.
    pub fn resolve(&self, handle: Handle) -> (usize, usize) {
        if handle.is_subpage() {
            let leaf = handle.memory_map_idx();
            let (leaf_off, _leaf_len) = self.node_byte_range(leaf);
            let elem_size = self.subpage_elem_size(leaf).expect("resolve: unknown subpage leaf");
            (leaf_off + handle.bitmap_idx() as usize * elem_size, elem_size)
        } else {
            self.node_byte_range(handle.memory_map_idx())
        }
    }
}

/// Stable chunk identity inside a [`ChunkSlab`]. Indices are reused
/// once a chunk is destroyed, so a `ChunkId` must never be compared
/// across a destroy/create pair with no intervening liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(usize);

/// Owns every pooled `Chunk` in an arena by index, so chunk-list rings
/// can be plain `Vec<ChunkId>`s instead of intrusive pointer links.
pub struct ChunkSlab<M: Memory> {
    slots: Vec<Option<Chunk<M>>>,
    free: Vec<usize>,
}

impl<M: Memory> Default for ChunkSlab<M> {
    fn default() -> Self {
        ChunkSlab {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<M: Memory> ChunkSlab<M> {
    pub fn insert(&mut self, chunk: Chunk<M>) -> ChunkId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(chunk);
            ChunkId(idx)
        } else {
            self.slots.push(Some(chunk));
            ChunkId(self.slots.len() - 1)
        }
    }

    pub fn remove(&mut self, id: ChunkId) -> Chunk<M> {
        let chunk = self.slots[id.0].take().expect("double remove of chunk slot");
        self.free.push(id.0);
        chunk
    }

    pub fn get(&self, id: ChunkId) -> &Chunk<M> {
        self.slots[id.0].as_ref().expect("stale ChunkId")
    }

    pub fn get_mut(&mut self, id: ChunkId) -> &mut Chunk<M> {
        self.slots[id.0].as_mut().expect("stale ChunkId")
    }

    /// Borrow two distinct chunks mutably at once (needed by
    /// `reallocate`'s source/destination copy). Panics if `a == b`.
    pub fn get_pair_mut(&mut self, a: ChunkId, b: ChunkId) -> (&mut Chunk<M>, &mut Chunk<M>) {
        assert_ne!(a.0, b.0, "get_pair_mut requires distinct chunks");
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (left, right) = self.slots.split_at_mut(hi);
        let lo_ref = left[lo].as_mut().expect("stale ChunkId");
        let hi_ref = right[0].as_mut().expect("stale ChunkId");
        if a.0 < b.0 {
            (lo_ref, hi_ref)
        } else {
            (hi_ref, lo_ref)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(page_size: usize, max_order: u32) -> Chunk<Vec<u8>> {
        let mem = vec![0u8; page_size << max_order];
        Chunk::new(mem, page_size, page_size.trailing_zeros(), max_order)
    }

    #[test]
    fn allocate_run_updates_root_to_min_of_children() {
        let mut c = chunk(8192, 11); // 16 MiB chunk, 2048 pages
        let h = c.allocate_run(65536).unwrap(); // 8 pages
        assert!(!h.is_subpage());
        assert_eq!(c.free_bytes(), c.chunk_size() - 65536);
    }

    #[test]
    fn free_run_restores_free_bytes_and_allows_reallocation() {
        let mut c = chunk(8192, 11);
        let h = c.allocate_run(65536).unwrap();
        c.free_run(h, 65536);
        assert_eq!(c.free_bytes(), c.chunk_size());
        let h2 = c.allocate_run(65536).unwrap();
        assert_eq!(h, h2, "first-fit should reuse the freed node");
    }

    #[test]
    fn run_allocations_never_alias() {
        let mut c = chunk(8192, 11);
        let a = c.allocate_run(8192 * 4).unwrap();
        let b = c.allocate_run(8192 * 4).unwrap();
        let (a_off, a_len) = c.resolve(a);
        let (b_off, b_len) = c.resolve(b);
        assert!(a_off + a_len <= b_off || b_off + b_len <= a_off);
    }

    #[test]
    fn subpage_allocation_carves_first_slot() {
        let mut c = chunk(8192, 11);
        let h = c.allocate_subpage(32).unwrap();
        assert!(h.is_subpage());
        assert_eq!(h.bitmap_idx(), 0);
        assert_eq!(c.free_bytes(), c.chunk_size() - 32);
    }

    #[test]
    fn releasing_a_subpage_returns_its_page_to_the_buddy_tree() {
        let mut c = chunk(8192, 11);
        let h = c.allocate_subpage(4096).unwrap(); // 2 slots
        let leaf = h.memory_map_idx();
        let transition = c.free_subpage(h, 4096);
        assert_eq!(transition, FreeTransition::BecameAvailable);
        let h2 = c.allocate_subpage_slot(leaf, 4096).unwrap();
        let transition2 = c.free_subpage(h2, 4096);
        assert_eq!(transition2, FreeTransition::FullyFree);
        c.release_subpage(leaf);
        assert_eq!(c.free_bytes(), c.chunk_size());
        let h3 = c.allocate_run(c.chunk_size()).unwrap();
        assert_eq!(h3.memory_map_idx(), 1, "whole chunk must be free again");
    }

    #[test]
    fn chunk_slab_reuses_freed_slots() {
        let mut slab: ChunkSlab<Vec<u8>> = ChunkSlab::default();
        let id1 = slab.insert(chunk(8192, 11));
        let id2 = slab.insert(chunk(8192, 11));
        slab.remove(id1);
        let id3 = slab.insert(chunk(8192, 11));
        assert_eq!(id3, id1);
        assert_ne!(id2, id1);
    }
}
