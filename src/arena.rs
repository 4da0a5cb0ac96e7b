//! Size-class routing and the Huge path: the public face of the pooled
//! byte-buffer allocator.
//!
//! Locking discipline: the guard structure below is a deliberate
//! design choice, documented in DESIGN.md. A separate guard per
//! size-class ring head, distinct from an arena-wide guard, would only
//! be safe in a language where a `Subpage`'s ring links and a
//! `Chunk`'s buddy tree are independently addressable heap objects; in
//! safe Rust a `Subpage` lives inside its owning `Chunk`, so splitting
//! its ring membership across a second lock without `unsafe` aliasing
//! isn't possible. One arena-wide `Mutex` instead covers the chunk
//! slab, the six `ChunkList` bands and the tiny/small subpage rings
//! together. The Tiny/Small/Huge/chunk-count counters still live in
//! `ArenaStats` as free-standing atomics, read without taking the
//! arena guard at all.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use log::warn;

use crate::chunk::{Chunk, ChunkId, ChunkSlab};
use crate::chunk_list::{Band, ChunkLists};
use crate::config::ArenaParams;
use crate::error::ArenaError;
use crate::handle::Handle;
use crate::platform::{Memory, Platform};
use crate::size_class::{self, SizeClass};
use crate::stats::ArenaMetrics;
use crate::stats::ArenaStats;

/// A narrow stand-in for an external buffer class: just enough state
/// for `Arena::reallocate` to do its job. Concrete heap-array/direct
/// `ByteBuf` wrappers are out of scope for this crate.
#[derive(Debug, Clone, Copy)]
pub struct BufView {
    pub(crate) chunk_id: ChunkId,
    pub(crate) huge: bool,
    pub handle: Handle,
    pub size_class: SizeClass,
    pub norm_capacity: usize,
    pub offset: usize,
    /// Usable capacity of the backing allocation (>= `length`).
    pub max_length: usize,
    /// Capacity actually requested by the caller.
    pub length: usize,
    pub reader_index: usize,
    pub writer_index: usize,
}

/// The thread-cache layer between callers and the arena, modeled as
/// an opaque capability the core only ever consults or offers a freed
/// handle to. `NoopCache` disables caching entirely.
pub trait ThreadCache<P: Platform>: Send + Sync {
    /// Try to satisfy a Tiny/Small/Normal request straight from the
    /// cache. `None` means "not cached here, ask the arena".
    fn allocate(&self, size_class: SizeClass, norm_capacity: usize) -> Option<BufView>;

    /// Offer a freed handle to the cache. `true` means the cache took
    /// it (the arena must not also return it to its `ChunkList`).
    fn add(&self, chunk_id: ChunkId, handle: Handle, norm_capacity: usize, size_class: SizeClass) -> bool;
}

/// The absent-cache case: every request falls through to the arena,
/// every free returns straight to the owning `ChunkList`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl<P: Platform> ThreadCache<P> for NoopCache {
    fn allocate(&self, _size_class: SizeClass, _norm_capacity: usize) -> Option<BufView> {
        None
    }

    fn add(&self, _chunk_id: ChunkId, _handle: Handle, _norm_capacity: usize, _size_class: SizeClass) -> bool {
        false
    }
}

struct ArenaState<M: Memory> {
    chunks: ChunkSlab<M>,
    lists: ChunkLists,
    tiny_rings: [std::collections::VecDeque<(ChunkId, u32)>; size_class::TINY_CLASSES],
    small_rings: Vec<std::collections::VecDeque<(ChunkId, u32)>>,
}

impl<M: Memory> ArenaState<M> {
    fn new(small_classes: usize) -> Self {
        ArenaState {
            chunks: ChunkSlab::default(),
            lists: ChunkLists::new(),
            tiny_rings: std::array::from_fn(|_| std::collections::VecDeque::new()),
            small_rings: (0..small_classes).map(|_| std::collections::VecDeque::new()).collect(),
        }
    }

    fn ring_mut(&mut self, sc: SizeClass) -> &mut std::collections::VecDeque<(ChunkId, u32)> {
        match sc {
            SizeClass::Tiny(i) => &mut self.tiny_rings[i],
            SizeClass::Small(i) => &mut self.small_rings[i],
            _ => unreachable!("subpage rings only exist for Tiny/Small"),
        }
    }

    fn ring_pop(&mut self, sc: SizeClass) -> Option<(ChunkId, u32)> {
        self.ring_mut(sc).pop_front()
    }

    fn ring_push(&mut self, sc: SizeClass, entry: (ChunkId, u32)) {
        self.ring_mut(sc).push_front(entry);
    }

    fn ring_remove(&mut self, sc: SizeClass, entry: (ChunkId, u32)) {
        let ring = self.ring_mut(sc);
        if let Some(pos) = ring.iter().position(|&e| e == entry) {
            ring.remove(pos);
        }
    }

    fn ring_is_sole(&mut self, sc: SizeClass, entry: (ChunkId, u32)) -> bool {
        let ring = self.ring_mut(sc);
        ring.len() == 1 && ring.front() == Some(&entry)
    }
}

/// The pooled byte-buffer arena: a size-class router in front of a
/// buddy-tree chunk pool.
pub struct Arena<P: Platform> {
    platform: P,
    params: ArenaParams,
    state: Mutex<ArenaState<P::Memory>>,
    huge: Mutex<ChunkSlab<P::Memory>>,
    pub stats: ArenaStats,
}

impl<P: Platform> Arena<P> {
    pub fn new(platform: P, params: ArenaParams) -> Result<Self, ArenaError> {
        params.validate()?;
        let small_classes = size_class::small_classes(params.page_shifts);
        Ok(Arena {
            platform,
            params,
            state: Mutex::new(ArenaState::new(small_classes)),
            huge: Mutex::new(ChunkSlab::default()),
            stats: ArenaStats::default(),
        })
    }

    pub fn params(&self) -> ArenaParams {
        self.params
    }

    /// Service `req_capacity` bytes, consulting `cache` first for
    /// Tiny/Small/Normal requests.
    pub fn allocate(&self, cache: &dyn ThreadCache<P>, req_capacity: i64) -> Result<BufView, ArenaError> {
        let chunk_size = self.params.chunk_size();
        let norm = size_class::normalize(req_capacity, chunk_size)?;
        let sc = size_class::classify(norm, self.params.page_size, chunk_size);
        let norm_capacity = norm as usize;

        match sc {
            SizeClass::Huge => self.allocate_huge(req_capacity, norm_capacity),
            SizeClass::Tiny(_) | SizeClass::Small(_) => {
                debug_assert_eq!(
                    norm_capacity,
                    size_class::elem_size(sc),
                    "normalized capacity must match its size-class element size"
                );
                if let Some(buf) = cache.allocate(sc, norm_capacity) {
                    return Ok(self.with_req_len(buf, req_capacity));
                }
                let buf = self.allocate_subpage_sized(sc, norm_capacity)?;
                Ok(self.with_req_len(buf, req_capacity))
            }
            SizeClass::Normal => {
                if let Some(buf) = cache.allocate(sc, norm_capacity) {
                    return Ok(self.with_req_len(buf, req_capacity));
                }
                let buf = self.allocate_normal(norm_capacity)?;
                Ok(self.with_req_len(buf, req_capacity))
            }
        }
    }

    fn with_req_len(&self, mut buf: BufView, req_capacity: i64) -> BufView {
        buf.length = req_capacity as usize;
        buf
    }

    fn allocate_huge(&self, req_capacity: i64, norm_capacity: usize) -> Result<BufView, ArenaError> {
        let memory = self.platform.new_unpooled_chunk(norm_capacity);
        let chunk: Chunk<P::Memory> = Chunk::new_unpooled(memory, self.params.page_size, self.params.page_shifts);
        let chunk_id = self.huge.lock().unwrap().insert(chunk);
        self.stats.huge.increase(norm_capacity as i64);
        self.stats.chunks_created.increment();
        Ok(BufView {
            chunk_id,
            huge: true,
            handle: Handle::run(1),
            size_class: SizeClass::Huge,
            norm_capacity,
            offset: 0,
            max_length: norm_capacity,
            length: req_capacity as usize,
            reader_index: 0,
            writer_index: 0,
        })
    }

    /// Tiny/Small path: fast path through the size-class ring, falling
    /// through to a full `ChunkList` band search when the ring has no
    /// subpage with room.
    fn allocate_subpage_sized(&self, sc: SizeClass, norm_capacity: usize) -> Result<BufView, ArenaError> {
        let mut state = self.state.lock().unwrap();
        if let Some((chunk_id, leaf)) = state.ring_pop(sc) {
            let chunk = state.chunks.get_mut(chunk_id);
            let handle = chunk
                .allocate_subpage_slot(leaf, norm_capacity)
                .expect("ring entry must reference a subpage with room");
            if chunk.subpage_has_room(leaf) {
                state.ring_push(sc, (chunk_id, leaf));
            }
            let (offset, _) = chunk.resolve(handle);
            self.record_pooled_alloc(sc, norm_capacity);
            return Ok(BufView {
                chunk_id,
                huge: false,
                handle,
                size_class: sc,
                norm_capacity,
                offset,
                max_length: norm_capacity,
                length: norm_capacity,
                reader_index: 0,
                writer_index: 0,
            });
        }

        for &band in Band::SEARCH_ORDER.iter() {
            let candidates = state.lists.snapshot(band);
            for chunk_id in candidates {
                if let Some(handle) = state.chunks.get_mut(chunk_id).allocate_subpage(norm_capacity) {
                    let leaf = handle.memory_map_idx();
                    let usage = state.chunks.get(chunk_id).usage_percent();
                    let new_band = state.lists.promote(band, chunk_id, usage);
                    state.chunks.get_mut(chunk_id).set_band(Some(new_band));
                    if state.chunks.get(chunk_id).subpage_has_room(leaf) {
                        state.ring_push(sc, (chunk_id, leaf));
                    }
                    let (offset, _) = state.chunks.get(chunk_id).resolve(handle);
                    self.record_pooled_alloc(sc, norm_capacity);
                    return Ok(BufView {
                        chunk_id,
                        huge: false,
                        handle,
                        size_class: sc,
                        norm_capacity,
                        offset,
                        max_length: norm_capacity,
                        length: norm_capacity,
                        reader_index: 0,
                        writer_index: 0,
                    });
                }
            }
        }

        let (chunk_id, handle) = self.new_chunk_and_allocate(&mut state, |c| c.allocate_subpage(norm_capacity))?;
        let leaf = handle.memory_map_idx();
        if state.chunks.get(chunk_id).subpage_has_room(leaf) {
            state.ring_push(sc, (chunk_id, leaf));
        }
        let (offset, _) = state.chunks.get(chunk_id).resolve(handle);
        self.record_pooled_alloc(sc, norm_capacity);
        Ok(BufView {
            chunk_id,
            huge: false,
            handle,
            size_class: sc,
            norm_capacity,
            offset,
            max_length: norm_capacity,
            length: norm_capacity,
            reader_index: 0,
            writer_index: 0,
        })
    }

    fn record_pooled_alloc(&self, sc: SizeClass, norm_capacity: usize) {
        match sc {
            SizeClass::Tiny(_) => self.stats.tiny.increase(norm_capacity as i64),
            SizeClass::Small(_) => self.stats.small.increase(norm_capacity as i64),
            SizeClass::Normal => self.stats.normal.increase(norm_capacity as i64),
            SizeClass::Huge => self.stats.huge.increase(norm_capacity as i64),
        }
    }

    /// Normal path: searches `q050, q025, q000, qInit, q075, q100` in
    /// that order, creating a fresh chunk on total miss.
    fn allocate_normal(&self, norm_capacity: usize) -> Result<BufView, ArenaError> {
        let mut state = self.state.lock().unwrap();
        for &band in Band::SEARCH_ORDER.iter() {
            self.stats.list_searches.increment();
            let candidates = state.lists.snapshot(band);
            for chunk_id in candidates {
                if let Some(handle) = state.chunks.get_mut(chunk_id).allocate_run(norm_capacity) {
                    let usage = state.chunks.get(chunk_id).usage_percent();
                    let new_band = state.lists.promote(band, chunk_id, usage);
                    state.chunks.get_mut(chunk_id).set_band(Some(new_band));
                    let (offset, _) = state.chunks.get(chunk_id).resolve(handle);
                    self.record_pooled_alloc(SizeClass::Normal, norm_capacity);
                    return Ok(BufView {
                        chunk_id,
                        huge: false,
                        handle,
                        size_class: SizeClass::Normal,
                        norm_capacity,
                        offset,
                        max_length: norm_capacity,
                        length: norm_capacity,
                        reader_index: 0,
                        writer_index: 0,
                    });
                }
            }
        }

        let (chunk_id, handle) = self.new_chunk_and_allocate(&mut state, |c| c.allocate_run(norm_capacity))?;
        let (offset, _) = state.chunks.get(chunk_id).resolve(handle);
        self.record_pooled_alloc(SizeClass::Normal, norm_capacity);
        Ok(BufView {
            chunk_id,
            huge: false,
            handle,
            size_class: SizeClass::Normal,
            norm_capacity,
            offset,
            max_length: norm_capacity,
            length: norm_capacity,
            reader_index: 0,
            writer_index: 0,
        })
    }

    fn new_chunk_and_allocate(
        &self,
        state: &mut ArenaState<P::Memory>,
        op: impl FnOnce(&mut Chunk<P::Memory>) -> Option<Handle>,
    ) -> Result<(ChunkId, Handle), ArenaError> {
        let memory = self.platform.new_chunk(self.params.chunk_size());
        let mut chunk = Chunk::new(memory, self.params.page_size, self.params.page_shifts, self.params.max_order);
        let handle = op(&mut chunk).expect("a freshly created chunk must satisfy any single request within its size");
        let chunk_id = state.chunks.insert(chunk);
        state.chunks.get_mut(chunk_id).set_band(Some(Band::QInit));
        state.lists.insert_new(chunk_id);
        self.stats.chunks_created.increment();
        Ok((chunk_id, handle))
    }

    /// Return a handle to the arena. `cache` is offered first; if it
    /// declines, the handle returns to its owning `ChunkList`,
    /// destroying the chunk outside the guard if that list reports
    /// underflow past `q000`.
    pub fn free(&self, cache: &dyn ThreadCache<P>, buf: &BufView) {
        if buf.huge {
            self.free_huge(buf);
            return;
        }
        if cache.add(buf.chunk_id, buf.handle, buf.norm_capacity, buf.size_class) {
            return;
        }

        let destroyed = {
            let mut state = self.state.lock().unwrap();
            if buf.handle.is_subpage() {
                let leaf = buf.handle.memory_map_idx();
                let transition = state.chunks.get_mut(buf.chunk_id).free_subpage(buf.handle, buf.norm_capacity);
                use crate::subpage::FreeTransition;
                match transition {
                    FreeTransition::StillPartial => {}
                    FreeTransition::BecameAvailable => {
                        state.ring_push(buf.size_class, (buf.chunk_id, leaf));
                    }
                    FreeTransition::FullyFree => {
                        let entry = (buf.chunk_id, leaf);
                        if !state.ring_is_sole(buf.size_class, entry) {
                            state.ring_remove(buf.size_class, entry);
                            state.chunks.get_mut(buf.chunk_id).release_subpage(leaf);
                        }
                    }
                }
            } else {
                state.chunks.get_mut(buf.chunk_id).free_run(buf.handle, buf.norm_capacity);
            }

            let usage = state.chunks.get(buf.chunk_id).usage_percent();
            let band = state.chunks.get(buf.chunk_id).band().expect("pooled chunk always has a band");
            match state.lists.demote(band, buf.chunk_id, usage) {
                Some(new_band) => {
                    state.chunks.get_mut(buf.chunk_id).set_band(Some(new_band));
                    None
                }
                None => Some(state.chunks.remove(buf.chunk_id)),
            }
        };

        match buf.size_class {
            SizeClass::Tiny(_) => self.stats.tiny.decrease(buf.norm_capacity as i64),
            SizeClass::Small(_) => self.stats.small.decrease(buf.norm_capacity as i64),
            SizeClass::Normal => self.stats.normal.decrease(buf.norm_capacity as i64),
            SizeClass::Huge => unreachable!(),
        }

        if let Some(chunk) = destroyed {
            self.stats.chunks_destroyed.increment();
            let size = chunk.chunk_size();
            drop(chunk);
            self.platform.destroy_chunk(size);
        }
    }

    fn free_huge(&self, buf: &BufView) {
        let chunk = self.huge.lock().unwrap().remove(buf.chunk_id);
        self.stats.huge.decrease(buf.norm_capacity as i64);
        self.stats.chunks_destroyed.increment();
        let size = chunk.chunk_size();
        drop(chunk);
        self.platform.destroy_chunk(size);
    }

    /// Grow or shrink a buffer's backing allocation.
    /// Copies `[reader_index, writer_index)`, clamps both indices into
    /// the new length, and frees the old handle if requested.
    pub fn reallocate(
        &self,
        cache: &dyn ThreadCache<P>,
        buf: BufView,
        new_capacity: i64,
        free_old_memory: bool,
    ) -> Result<BufView, ArenaError> {
        let mut new_buf = self.allocate(cache, new_capacity)?;
        let live_len = buf.writer_index.saturating_sub(buf.reader_index);
        let copy_len = live_len.min(new_buf.max_length);
        if copy_len > 0 {
            self.copy_live_bytes(&buf, &mut new_buf, copy_len);
        }
        new_buf.reader_index = 0;
        new_buf.writer_index = copy_len;
        if free_old_memory {
            self.free(cache, &buf);
        }
        Ok(new_buf)
    }

    fn copy_live_bytes(&self, src: &BufView, dst: &mut BufView, len: usize) {
        let src_off = src.offset + src.reader_index;
        let dst_off = dst.offset;
        match (src.huge, dst.huge) {
            (false, false) if src.chunk_id != dst.chunk_id => {
                let mut state = self.state.lock().unwrap();
                let (src_chunk, dst_chunk) = state.chunks.get_pair_mut(src.chunk_id, dst.chunk_id);
                self.platform
                    .memory_copy(src_chunk.memory(), src_off, dst_chunk.memory_mut(), dst_off, len);
            }
            (true, true) if src.chunk_id != dst.chunk_id => {
                let mut huge = self.huge.lock().unwrap();
                let (src_chunk, dst_chunk) = huge.get_pair_mut(src.chunk_id, dst.chunk_id);
                self.platform
                    .memory_copy(src_chunk.memory(), src_off, dst_chunk.memory_mut(), dst_off, len);
            }
            _ => {
                // Cross-slab (pooled <-> huge) or same-chunk: the two
                // regions can't be borrowed from one lock at once, so
                // stage through a short-lived owned copy instead.
                let staged = self.snapshot_bytes(src, src_off, len);
                self.write_bytes(dst, dst_off, &staged);
            }
        }
    }

    fn snapshot_bytes(&self, buf: &BufView, off: usize, len: usize) -> Vec<u8> {
        if buf.huge {
            let huge = self.huge.lock().unwrap();
            huge.get(buf.chunk_id).memory().as_slice()[off..off + len].to_vec()
        } else {
            let state = self.state.lock().unwrap();
            state.chunks.get(buf.chunk_id).memory().as_slice()[off..off + len].to_vec()
        }
    }

    fn write_bytes(&self, buf: &BufView, off: usize, data: &[u8]) {
        if buf.huge {
            let mut huge = self.huge.lock().unwrap();
            huge.get_mut(buf.chunk_id).memory_mut().as_mut_slice()[off..off + data.len()].copy_from_slice(data);
        } else {
            let mut state = self.state.lock().unwrap();
            state.chunks.get_mut(buf.chunk_id).memory_mut().as_mut_slice()[off..off + data.len()].copy_from_slice(data);
        }
    }

    /// A plain-data snapshot of current occupancy, suitable for a
    /// diagnostics endpoint or periodic logging.
    pub fn metrics(&self) -> ArenaMetrics {
        let state = self.state.lock().unwrap();
        let mut chunks_per_band = [0usize; 6];
        for (i, &band) in Band::ALL.iter().enumerate() {
            chunks_per_band[i] = state.lists.len(band);
        }
        let tiny_rings_nonempty = state.tiny_rings.iter().filter(|r| !r.is_empty()).count();
        let small_rings_nonempty = state.small_rings.iter().filter(|r| !r.is_empty()).count();
        ArenaMetrics {
            chunks_per_band,
            tiny_rings_nonempty,
            small_rings_nonempty,
            tiny_allocated: self.stats.tiny.current(),
            small_allocated: self.stats.small.current(),
            normal_allocated: self.stats.normal.current(),
            huge_allocated: self.stats.huge.current(),
            chunks_created: self.stats.chunks_created.total(),
            chunks_destroyed: self.stats.chunks_destroyed.total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HeapPlatform;

    fn small_arena() -> Arena<HeapPlatform> {
        let params = ArenaParams {
            page_size: 8192,
            page_shifts: 13,
            max_order: 4, // 128 KiB chunks, keeps tests fast
        };
        Arena::new(HeapPlatform, params).unwrap()
    }

    #[test]
    fn tiny_allocation_routes_to_tiny_ring() {
        let arena = small_arena();
        let cache = NoopCache;
        let buf = arena.allocate(&cache, 24).unwrap();
        assert_eq!(buf.norm_capacity, 32);
        assert!(matches!(buf.size_class, SizeClass::Tiny(2)));
    }

    #[test]
    fn small_allocation_routes_to_small_ring() {
        let arena = small_arena();
        let cache = NoopCache;
        let buf = arena.allocate(&cache, 3000).unwrap();
        assert_eq!(buf.norm_capacity, 4096);
        assert!(matches!(buf.size_class, SizeClass::Small(3)));
    }

    #[test]
    fn normal_allocation_takes_a_page_run() {
        let arena = small_arena();
        let cache = NoopCache;
        let buf = arena.allocate(&cache, 40000).unwrap();
        assert_eq!(buf.norm_capacity, 65536);
        assert!(matches!(buf.size_class, SizeClass::Normal));
    }

    #[test]
    fn huge_allocation_is_unpooled() {
        let arena = small_arena();
        let cache = NoopCache;
        let buf = arena.allocate(&cache, 20 * 1024 * 1024).unwrap();
        assert!(matches!(buf.size_class, SizeClass::Huge));
        assert_eq!(arena.stats.huge.current(), 20 * 1024 * 1024);
        arena.free(&cache, &buf);
        assert_eq!(arena.stats.huge.current(), 0);
        assert_eq!(arena.stats.chunks_destroyed.total(), 1);
    }

    #[test]
    fn allocations_never_alias() {
        let arena = small_arena();
        let cache = NoopCache;
        let a = arena.allocate(&cache, 4096).unwrap();
        let b = arena.allocate(&cache, 4096).unwrap();
        assert!(a.chunk_id != b.chunk_id || a.handle != b.handle);
    }

    #[test]
    fn free_and_reallocate_reuses_handles() {
        let arena = small_arena();
        let cache = NoopCache;
        let a = arena.allocate(&cache, 32).unwrap();
        arena.free(&cache, &a);
        let b = arena.allocate(&cache, 32).unwrap();
        assert_eq!(a.handle, b.handle);
    }

    #[test]
    fn reallocate_grows_and_copies_live_bytes() {
        let arena = small_arena();
        let cache = NoopCache;
        let mut a = arena.allocate(&cache, 32).unwrap();
        {
            let mut state = arena.state.lock().unwrap();
            let chunk = state.chunks.get_mut(a.chunk_id);
            chunk.memory_mut().as_mut_slice()[a.offset..a.offset + 4].copy_from_slice(&[9, 8, 7, 6]);
        }
        a.writer_index = 4;
        let b = arena.reallocate(&cache, a, 128, true).unwrap();
        assert_eq!(b.writer_index, 4);
        let state = arena.state.lock().unwrap();
        let chunk = state.chunks.get(b.chunk_id);
        assert_eq!(&chunk.memory().as_slice()[b.offset..b.offset + 4], &[9, 8, 7, 6]);
    }

    #[test]
    fn normal_promotion_follows_quarter_fill_sequence() {
        // 128 KiB chunk, 32 KiB (25%) Normal allocations: the same
        // chunk should be found and reused by each successive
        // allocation (via the band it was last promoted into) and walk
        // qInit -> q000 -> q050 -> q100 as usage climbs by 25% each time.
        let arena = small_arena();
        let cache = NoopCache;
        let step = 32 * 1024;

        let a = arena.allocate(&cache, step).unwrap();
        {
            let state = arena.state.lock().unwrap();
            assert_eq!(state.chunks.get(a.chunk_id).band(), Some(Band::QInit));
        }

        let b = arena.allocate(&cache, step).unwrap();
        assert_eq!(b.chunk_id, a.chunk_id, "second alloc must reuse the only chunk");
        {
            let state = arena.state.lock().unwrap();
            assert_eq!(state.chunks.get(b.chunk_id).band(), Some(Band::Q000));
        }

        let c = arena.allocate(&cache, step).unwrap();
        assert_eq!(c.chunk_id, a.chunk_id);
        {
            let state = arena.state.lock().unwrap();
            assert_eq!(state.chunks.get(c.chunk_id).band(), Some(Band::Q050));
        }

        let d = arena.allocate(&cache, step).unwrap();
        assert_eq!(d.chunk_id, a.chunk_id);
        {
            let state = arena.state.lock().unwrap();
            assert_eq!(state.chunks.get(d.chunk_id).band(), Some(Band::Q100));
        }
    }

    #[test]
    fn metrics_reports_chunk_creation() {
        let arena = small_arena();
        let cache = NoopCache;
        let _buf = arena.allocate(&cache, 4096).unwrap();
        let m = arena.metrics();
        assert_eq!(m.chunks_created, 1);
        assert!(m.chunks_per_band.iter().sum::<usize>() >= 1);
    }
}
