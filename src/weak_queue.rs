//! Cross-thread return path for recycled objects.
//!
//! A [`QueueNode`] is a `WeakOrderQueue`: the chain of fixed-capacity
//! [`Link`]s a single foreign thread appends to when it recycles an
//! object it doesn't own. The owning thread's `Stack` later drains
//! these via [`QueueNode::transfer`].
//!
//! A singly linked list of queues would let the head be scanned
//! without a guard on the hot insertion path. A guarded `Vec`
//! collapses that lock-free-insertion motivation (this crate already
//! takes the target `Stack`'s guard once per queue *creation*, the
//! only operation that actually needs one), while keeping the same
//! observable rule: the head (index 0) is retained even once its
//! producer is found dead, everything after it is fair game to reap.
//! See DESIGN.md.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub const LINK_CAPACITY: usize = 16;

/// A fixed-capacity segment of a `WeakOrderQueue`. The producer thread
/// writes elements and bumps `write_index` with a release store
/// (lazy-set semantics); the consuming (owning) thread reads with an
/// acquire load. `read_index` is touched only by the consumer, so it
/// needs no atomicity.
///
/// `E` is the element type the caller wants to move through the queue.
/// The recycler instantiates this with `(T, Arc<RecycleHandle<T>>)` so
/// the very `Handle` the object was checked out with survives the trip
/// and comes back out the other end unchanged, rather than this module
/// needing to know anything about `recycleId`/`lastRecycledId`.
struct Link<E> {
    elements: Box<[Cell<Option<E>>]>,
    write_index: AtomicUsize,
    read_index: Cell<usize>,
}

// SAFETY: `elements` is written only by the single producer thread
// that owns this link (at indices `< LINK_CAPACITY`, advancing
// `write_index` afterward), and read only by the single consumer
// thread, which never inspects slot `i` until `write_index > i` has
// been observed via an acquire load. The two threads never touch the
// same cell concurrently.
unsafe impl<E: Send> Sync for Link<E> {}

impl<E> Link<E> {
    fn new() -> Self {
        Link {
            elements: (0..LINK_CAPACITY).map(|_| Cell::new(None)).collect(),
            write_index: AtomicUsize::new(0),
            read_index: Cell::new(0),
        }
    }

    fn is_full(&self) -> bool {
        self.write_index.load(Ordering::Relaxed) == LINK_CAPACITY
    }

    /// Producer-side append. Caller already holds the per-queue tail
    /// guard, so this is the only writer touching this link's tail
    /// slot at a time; the atomic is for the consumer's benefit, not
    /// for producer/producer exclusion.
    fn push(&self, item: E) {
        let idx = self.write_index.load(Ordering::Relaxed);
        debug_assert!(idx < LINK_CAPACITY, "push into a full link");
        self.elements[idx].set(Some(item));
        self.write_index.store(idx + 1, Ordering::Release);
    }
}

struct LinkChain<E> {
    links: std::collections::VecDeque<Arc<Link<E>>>,
}

impl<E> LinkChain<E> {
    fn new() -> Self {
        let mut links = std::collections::VecDeque::new();
        links.push_back(Arc::new(Link::new()));
        LinkChain { links }
    }
}

/// One producing thread's queue of not-yet-returned objects destined
/// for a specific owning `Stack`. A weak reference to the producer
/// means this node's retention (by being linked into the target
/// stack's list) never keeps the producer thread's resources alive.
pub(crate) struct QueueNode<E> {
    pub id: u64,
    producer_alive: Weak<()>,
    chain: Mutex<LinkChain<E>>,
}

impl<E> QueueNode<E> {
    pub fn new(id: u64, producer_alive: Weak<()>) -> Self {
        QueueNode {
            id,
            producer_alive,
            chain: Mutex::new(LinkChain::new()),
        }
    }

    pub fn is_producer_alive(&self) -> bool {
        self.producer_alive.upgrade().is_some()
    }

    /// Append one item, growing the chain with a fresh link if the
    /// current tail is full. Called by the producer thread only.
    pub fn push(&self, item: E) {
        let chain = self.chain.lock().unwrap();
        let tail = chain.links.back().expect("link chain is never empty").clone();
        drop(chain);
        if tail.is_full() {
            let mut chain = self.chain.lock().unwrap();
            // Re-check under the lock: another append may have already
            // grown the chain (this node has a single producer thread,
            // but `push` can still race with chain-growth from a
            // previous call on the same thread if a caller re-enters;
            // cheap to double check).
            if chain.links.back().map(|l| l.is_full()).unwrap_or(true) {
                chain.links.push_back(Arc::new(Link::new()));
            }
            let new_tail = chain.links.back().unwrap().clone();
            drop(chain);
            new_tail.push(item);
        } else {
            tail.push(item);
        }
    }

    /// Drain whatever the producer has made visible from the head
    /// link, handing each item to `sink`. Advances past exhausted
    /// links (dropping them once fully read) and stops once `sink`
    /// signals it cannot accept more (destination at capacity). Returns
    /// `true` if at least one item was harvested.
    pub fn transfer(&self, mut sink: impl FnMut(E) -> bool) -> bool {
        let mut harvested = false;
        loop {
            let head = {
                let chain = self.chain.lock().unwrap();
                chain.links.front().cloned()
            };
            let Some(head) = head else { break };
            let avail = head.write_index.load(Ordering::Acquire);
            let mut idx = head.read_index.get();
            while idx < avail {
                let item = head.elements[idx].take().expect("write_index advanced past an unwritten slot");
                idx += 1;
                if !sink(item) {
                    head.read_index.set(idx);
                    return true;
                }
                harvested = true;
            }
            head.read_index.set(idx);

            // This link is exhausted only if it's also full (no more
            // writes are coming to it) and there is a successor to
            // advance to; otherwise it's simply the live tail.
            let mut chain = self.chain.lock().unwrap();
            if head.is_full() && chain.links.len() > 1 {
                chain.links.pop_front();
                continue;
            }
            break;
        }
        harvested
    }

    /// Drain everything remaining, ignoring capacity, used when a dead
    /// producer's node is about to be unlinked so its last batch isn't
    /// silently lost.
    pub fn drain_all(&self, mut sink: impl FnMut(E)) {
        self.transfer(|item| {
            sink(item);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_transfer_round_trip_in_order() {
        let alive = Arc::new(());
        let node: QueueNode<i32> = QueueNode::new(1, Arc::downgrade(&alive));
        for v in 0..5 {
            node.push(v);
        }
        let mut seen = Vec::new();
        node.transfer(|v| {
            seen.push(v);
            true
        });
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn transfer_grows_across_multiple_links() {
        let alive = Arc::new(());
        let node: QueueNode<i32> = QueueNode::new(1, Arc::downgrade(&alive));
        for v in 0..40 {
            node.push(v);
        }
        let mut seen = Vec::new();
        node.transfer(|v| {
            seen.push(v);
            true
        });
        assert_eq!(seen.len(), 40);
        assert_eq!(seen[39], 39);
    }

    #[test]
    fn transfer_stops_when_sink_declines() {
        let alive = Arc::new(());
        let node: QueueNode<i32> = QueueNode::new(1, Arc::downgrade(&alive));
        for v in 0..5 {
            node.push(v);
        }
        let mut seen = Vec::new();
        node.transfer(|v| {
            if seen.len() == 2 {
                return false;
            }
            seen.push(v);
            true
        });
        assert_eq!(seen, vec![0, 1]);
        // A second call picks up where the first left off.
        node.transfer(|v| {
            seen.push(v);
            true
        });
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn producer_liveness_tracks_the_arc() {
        let alive = Arc::new(());
        let node: QueueNode<i32> = QueueNode::new(1, Arc::downgrade(&alive));
        assert!(node.is_producer_alive());
        drop(alive);
        assert!(!node.is_producer_alive());
    }
}
