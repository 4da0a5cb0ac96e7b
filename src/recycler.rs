//! Per-thread object pool with cross-thread reclaim.
//!
//! Architecturally parallel to, but unrelated in purpose to, the arena
//! above: a [`Recycler<T>`] hands out [`Recycled<T>`] objects backed by
//! a thread-local [`Stack`], and lets an object freed on a non-owning
//! thread find its way home through a [`crate::weak_queue::QueueNode`]
//! without the producer ever taking the owner's lock on the hot path.
//!
//! The locking/thread-local structure here is documented at each
//! decision point, same as `arena.rs`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::config::RecyclerConfig;
use crate::error::{ArenaError, RecyclerError};
use crate::weak_queue::QueueNode;

/// Process-wide monotonically increasing id source for `Stack`s and
/// `QueueNode`s: only equality of ids is ever tested, so a single
/// counter shared between the two kinds is safe.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    /// Liveness token for the current thread, cloned into every
    /// `QueueNode` this thread creates as a producer. When the thread
    /// exits, its `ThreadLocalKey` destructor drops the only strong
    /// reference, and every `QueueNode`'s `Weak` upgrade starts
    /// failing, giving each queue a way to detect that its producer
    /// thread is gone without pinning that thread alive.
    static THREAD_ALIVE: Arc<()> = Arc::new(());
}

fn thread_alive_token() -> Arc<()> {
    THREAD_ALIVE.with(Arc::clone)
}

/// The object a [`Recycler::get`] call hands back: the value plus the
/// bookkeeping needed to return it later. Dropping one without calling
/// [`Recycled::recycle`] simply drops the value — recycling is opt-in,
/// a call the holder chooses to make, never something that happens
/// implicitly.
pub struct Recycled<T> {
    value: T,
    handle: Arc<RecycleHandle<T>>,
    generation: u64,
}

impl<T> std::ops::Deref for Recycled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for Recycled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Send + 'static> Recycled<T> {
    /// Return this object to its owning `Stack`, directly if called
    /// from the owning thread, or via a cross-thread queue otherwise.
    ///
    /// Only fails on a genuine contract violation: the normal safe API
    /// can't actually trigger one, since a `Recycled<T>` is consumed
    /// exactly once. The checks exist so those error paths are real
    /// and reachable from the lower-level [`RecycleHandle::recycle`] a
    /// caller could call directly with a stale handle clone.
    pub fn recycle(self) -> Result<(), RecyclerError> {
        self.handle.recycle(self.value, self.generation)
    }

    /// The handle backing this object, clonable for callers that want
    /// to move the value and its return path to another thread
    /// separately. Recycling later still requires the generation this
    /// `Recycled` was issued with; use [`Recycled::into_parts`].
    pub fn handle(&self) -> Arc<RecycleHandle<T>> {
        self.handle.clone()
    }

    /// Split into the raw value, its handle, and the generation token
    /// that must accompany a later [`RecycleHandle::recycle`] call.
    pub fn into_parts(self) -> (T, Arc<RecycleHandle<T>>, u64) {
        (self.value, self.handle, self.generation)
    }

    /// Discard the pooling relationship entirely and keep just the
    /// value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// The handle a [`Recycled<T>`] carries: which `Stack` it belongs to
/// and the `recycleId`/`lastRecycledId` pair that records its
/// residency.
///
/// Invariant: `recycle_id == 0 && last_recycled_id == 0` iff
/// outside any pool; both equal the owning stack's id iff resident in
/// its `Stack`; `last_recycled_id == queue_id && recycle_id in {0,
/// queue_id}` iff resident in a cross-thread queue.
pub struct RecycleHandle<T> {
    owner: Weak<Stack<T>>,
    recycle_id: AtomicU64,
    last_recycled_id: AtomicU64,
    /// Bumped every time the handle is checked out (popped from its
    /// `Stack` or freshly minted). A `recycle()` call must present the
    /// generation it was issued with — the safe-Rust stand-in for an
    /// "obj is the handle's bound value" identity check, since owned
    /// `T` values have no stable reference identity to compare against
    /// (see DESIGN.md).
    generation: AtomicU64,
}

impl<T: Send + 'static> RecycleHandle<T> {
    /// Return `obj` to this handle's owning `Stack`. `generation` must
    /// match the value most recently handed out for this handle
    /// (always true through the safe `Recycled::recycle` path); a
    /// mismatch means the caller is trying to recycle through a stale
    /// or already-recycled handle, surfaced as `AlienObject`. Finding
    /// the ids already non-zero at this point (resident somewhere) is
    /// `DoubleRecycle` and is the more common way the same underlying
    /// mistake shows up.
    pub fn recycle(self: Arc<Self>, obj: T, generation: u64) -> Result<(), RecyclerError> {
        if self.generation.load(Ordering::Acquire) != generation {
            warn!("recycle called with a stale handle generation");
            return Err(RecyclerError::AlienObject);
        }
        if self.recycle_id.load(Ordering::Acquire) != 0 || self.last_recycled_id.load(Ordering::Acquire) != 0 {
            warn!("recycle called on a handle already resident in a pool");
            return Err(RecyclerError::DoubleRecycle);
        }

        let Some(owner) = self.owner.upgrade() else {
            // Owning thread's stack is gone. Not a contract
            // violation; the object is simply dropped by returning
            // here and letting `obj` fall out of scope.
            return Ok(());
        };

        if owner.is_current_thread() {
            owner.push(obj, self);
        } else {
            owner.enqueue_from_other_thread(obj, self);
        }
        Ok(())
    }
}

/// Per-thread stack of reusable handles for one [`Recycler<T>`]
/// instance.
///
/// `elements`/`cursor` are touched only by the owning thread (pop,
/// push, scavenge); `queues` is the one field foreign threads reach
/// into, guarded by a `Mutex` taken only at `WeakOrderQueue` creation
/// time.
pub struct Stack<T> {
    id: u64,
    max_capacity: usize,
    owner_thread: std::thread::ThreadId,
    data: RefCell<StackData<T>>,
    queues: Mutex<Vec<Arc<QueueNode<(T, Arc<RecycleHandle<T>>)>>>>,
}

struct StackData<T> {
    elements: Vec<(T, Arc<RecycleHandle<T>>)>,
    /// Round-robin index into `queues` that `scavenge` resumes from,
    /// so repeated calls make progress across producers instead of
    /// always draining the same one first.
    cursor: usize,
}

// SAFETY: `data` is read and written only by `owner_thread`, checked
// at every entry point via `is_current_thread`. `queues` is a `Mutex`
// and safe to touch from any thread by construction.
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T: Send + 'static> Stack<T> {
    fn new(max_capacity: usize) -> Arc<Self> {
        Arc::new(Stack {
            id: next_id(),
            max_capacity,
            owner_thread: std::thread::current().id(),
            data: RefCell::new(StackData {
                elements: Vec::new(),
                cursor: 0,
            }),
            queues: Mutex::new(Vec::new()),
        })
    }

    fn is_current_thread(&self) -> bool {
        self.owner_thread == std::thread::current().id()
    }

    /// Pop a handle, scavenging from other threads' queues first if
    /// empty.
    fn pop(self: &Arc<Self>) -> Option<(T, Arc<RecycleHandle<T>>)> {
        debug_assert!(self.is_current_thread(), "Stack::pop called off its owning thread");
        if self.data.borrow().elements.is_empty() {
            self.scavenge();
        }
        let mut data = self.data.borrow_mut();
        let (value, handle) = data.elements.pop()?;
        handle.recycle_id.store(0, Ordering::Relaxed);
        handle.last_recycled_id.store(0, Ordering::Relaxed);
        handle.generation.fetch_add(1, Ordering::AcqRel);
        Some((value, handle))
    }

    /// Push directly onto this stack (owning-thread recycle path).
    fn push(self: &Arc<Self>, value: T, handle: Arc<RecycleHandle<T>>) {
        debug_assert!(self.is_current_thread(), "Stack::push called off its owning thread");
        let mut data = self.data.borrow_mut();
        if self.max_capacity == 0 || data.elements.len() >= self.max_capacity {
            // Pool is saturated: drop silently rather than grow unbounded.
            return;
        }
        handle.recycle_id.store(self.id, Ordering::Relaxed);
        handle.last_recycled_id.store(self.id, Ordering::Relaxed);
        data.elements.push((value, handle));
    }

    /// Append to (or create) this thread's `WeakOrderQueue` targeting
    /// `self`, the cross-thread half of returning an object to its
    /// owner. Called on the producing (non-owning) thread.
    fn enqueue_from_other_thread(self: &Arc<Self>, value: T, handle: Arc<RecycleHandle<T>>) {
        debug_assert!(!self.is_current_thread());
        DELAYED_RECYCLED.with(|map| {
            let mut map = map.borrow_mut();
            let map = map.entry(self.id).or_insert_with(HashMap::new);
            let node = map.entry(TypeKey::of::<T>()).or_insert_with(|| {
                let node = Arc::new(QueueNode::new(next_id(), Arc::downgrade(&thread_alive_token())));
                let mut queues = self.queues.lock().unwrap();
                queues.push(node.clone());
                AnyQueueNode::new(node.clone())
            });
            let node = node.downcast::<(T, Arc<RecycleHandle<T>>)>();
            handle.last_recycled_id.store(node.id, Ordering::Relaxed);
            node.push((value, handle));
        });
    }

    /// Import cross-thread-released objects into `elements`: walk the
    /// queue list starting from the remembered cursor, harvest one
    /// `QueueNode`'s worth, and stop. Dead producers are unlinked
    /// (head excepted) as we pass over them.
    fn scavenge(self: &Arc<Self>) {
        let mut queues = self.queues.lock().unwrap();
        if queues.is_empty() {
            return;
        }
        let len = queues.len();
        let start = self.data.borrow().cursor % len;
        let mut i = start;
        loop {
            let node = queues[i].clone();

            // Restamp a harvested (value, handle) pair as resident in
            // this stack before admitting it, validating the
            // recycleId/lastRecycledId pair the handle already carries
            // from its time in the cross-thread queue.
            let restamp = |data: &mut StackData<T>, value: T, handle: Arc<RecycleHandle<T>>| {
                let last = handle.last_recycled_id.load(Ordering::Relaxed);
                let recycle = handle.recycle_id.load(Ordering::Relaxed);
                if recycle == 0 {
                    handle.recycle_id.store(last, Ordering::Relaxed);
                }
                handle.recycle_id.store(self.id, Ordering::Relaxed);
                handle.last_recycled_id.store(self.id, Ordering::Relaxed);
                data.elements.push((value, handle));
            };

            let harvested = {
                let mut data = self.data.borrow_mut();
                let cap = self.max_capacity;
                node.transfer(|(value, handle)| {
                    if cap != 0 && data.elements.len() >= cap {
                        return false;
                    }
                    restamp(&mut data, value, handle);
                    true
                })
            };

            if harvested {
                self.data.borrow_mut().cursor = (i + 1) % queues.len();
                return;
            }

            if i != 0 && !node.is_producer_alive() {
                node.drain_all(|(value, handle)| {
                    let mut data = self.data.borrow_mut();
                    restamp(&mut data, value, handle);
                });
                queues.remove(i);
                if queues.is_empty() {
                    self.data.borrow_mut().cursor = 0;
                    return;
                }
                // Don't advance `i`: another node has slid into this
                // index.
                if i >= queues.len() {
                    i = 0;
                }
                continue;
            }

            i = (i + 1) % queues.len();
            if i == start {
                self.data.borrow_mut().cursor = i;
                return;
            }
        }
    }
}

/// Type-erased storage for the `HashMap<u64, ...>` of per-target-stack
/// `WeakOrderQueue`s a producing thread keeps, since a single thread
/// can be a foreign producer for `Recycler<T>`s of different `T`.
struct AnyQueueNode {
    node: Box<dyn std::any::Any>,
}

impl AnyQueueNode {
    fn new<T: Send + 'static>(node: Arc<QueueNode<T>>) -> Self {
        AnyQueueNode { node: Box::new(node) }
    }

    fn downcast<T: Send + 'static>(&self) -> Arc<QueueNode<T>> {
        self.node
            .downcast_ref::<Arc<QueueNode<T>>>()
            .expect("TypeKey collision in delayed-recycled map")
            .clone()
    }
}

/// Disambiguates `Recycler<T>` instances that share the same `T` within
/// one producing thread's per-target-`Stack` queue map: `TypeId` alone
/// would conflate two distinct `Recycler<SameType>` pools.
#[derive(Hash, PartialEq, Eq, Clone, Copy)]
struct TypeKey(std::any::TypeId);

impl TypeKey {
    fn of<T: 'static>() -> Self {
        TypeKey(std::any::TypeId::of::<T>())
    }
}

thread_local! {
    /// Per-thread map from a target `Stack`'s id to that thread's
    /// `WeakOrderQueue` feeding it, keyed further by `T`.
    static DELAYED_RECYCLED: RefCell<HashMap<u64, HashMap<TypeKey, AnyQueueNode>>> = RefCell::new(HashMap::new());
}

/// A per-`T` process-wide table of thread-local `Stack<T>`s, one entry
/// per live [`Recycler<T>`] instance (keyed by that instance's id).
/// `thread_local!` names one static slot per monomorphization of this
/// function, so distinct `Recycler<T>` instances sharing the same `T`
/// are told apart by `recycler_id`.
fn with_stack<T: Send + 'static, R>(recycler_id: u64, max_capacity: usize, f: impl FnOnce(&Arc<Stack<T>>) -> R) -> R {
    thread_local! {
        static STACKS: RefCell<HashMap<u64, Arc<dyn std::any::Any>>> = RefCell::new(HashMap::new());
    }
    STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        let entry = stacks
            .entry(recycler_id)
            .or_insert_with(|| Stack::<T>::new(max_capacity) as Arc<dyn std::any::Any>);
        let stack = entry.clone().downcast::<Stack<T>>().expect("recycler id reused across types");
        drop(stacks);
        f(&stack)
    })
}

/// A pooled-object factory bound to one thread-local `Stack<T>` per
/// thread.
pub struct Recycler<T, F> {
    id: u64,
    config: RecyclerConfig,
    factory: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static, F: Fn() -> T> Recycler<T, F> {
    /// `config.max_capacity` caps how many objects each thread's
    /// `Stack` retains; `0` disables pooling entirely — every `get`
    /// then allocates fresh and `recycle` always drops. Rejects
    /// `config` if it fails [`RecyclerConfig::validate`].
    pub fn new(config: RecyclerConfig, factory: F) -> Result<Self, ArenaError> {
        config.validate()?;
        Ok(Recycler {
            id: next_id(),
            config,
            factory,
            _marker: std::marker::PhantomData,
        })
    }

    /// Obtain an object: reuse one from this thread's stack if
    /// available (scavenging cross-thread returns first), else
    /// materialize a fresh one via the factory.
    pub fn get(&self) -> Recycled<T> {
        with_stack::<T, _>(self.id, self.config.max_capacity, |stack| {
            if let Some((value, handle)) = stack.pop() {
                let generation = handle.generation.load(Ordering::Acquire);
                return Recycled { value, handle, generation };
            }
            let handle = Arc::new(RecycleHandle {
                owner: Arc::downgrade(stack),
                recycle_id: AtomicU64::new(0),
                last_recycled_id: AtomicU64::new(0),
                generation: AtomicU64::new(1),
            });
            Recycled {
                value: (self.factory)(),
                handle,
                generation: 1,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn get_then_recycle_is_reused_on_same_thread() {
        let made = Arc::new(AtomicUsize::new(0));
        let made2 = made.clone();
        let recycler = Recycler::new(RecyclerConfig { max_capacity: 16 }, move || {
            made2.fetch_add(1, Ordering::Relaxed);
            Vec::<u8>::with_capacity(64)
        })
        .unwrap();

        let a = recycler.get();
        assert_eq!(made.load(Ordering::Relaxed), 1);
        a.recycle().unwrap();

        let b = recycler.get();
        assert_eq!(made.load(Ordering::Relaxed), 1, "second get must reuse, not allocate");
        b.recycle().unwrap();
    }

    #[test]
    fn distinct_recycler_instances_of_the_same_type_do_not_share_a_stack() {
        let r1 = Recycler::new(RecyclerConfig { max_capacity: 16 }, || 0i32).unwrap();
        let r2 = Recycler::new(RecyclerConfig { max_capacity: 16 }, || 0i32).unwrap();
        let a = r1.get();
        a.recycle().unwrap();
        // r2 has never had anything recycled into it, so it must
        // still allocate fresh rather than seeing r1's pooled value.
        let made = Arc::new(AtomicUsize::new(0));
        let made2 = made.clone();
        let r3 = Recycler::new(RecyclerConfig { max_capacity: 16 }, move || {
            made2.fetch_add(1, Ordering::Relaxed);
            0i32
        })
        .unwrap();
        let _ = r2;
        let _b = r3.get();
        assert_eq!(made.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_capacity_disables_pooling() {
        let made = Arc::new(AtomicUsize::new(0));
        let made2 = made.clone();
        let recycler = Recycler::new(RecyclerConfig { max_capacity: 0 }, move || {
            made2.fetch_add(1, Ordering::Relaxed);
            0u32
        })
        .unwrap();
        let a = recycler.get();
        a.recycle().unwrap();
        let _b = recycler.get();
        assert_eq!(made.load(Ordering::Relaxed), 2, "capacity 0 must allocate fresh every time");
    }

    #[test]
    fn double_recycle_is_a_contract_violation() {
        let recycler = Recycler::new(RecyclerConfig { max_capacity: 16 }, || 0u32).unwrap();
        let a = recycler.get();
        let (value, handle, generation) = a.into_parts();
        handle.clone().recycle(value, generation).unwrap();
        // Recycling again through the same stale handle/generation:
        // the ids are now non-zero (resident in the stack), so this
        // must fail rather than silently double-inserting.
        let err = handle.recycle(0u32, generation).unwrap_err();
        assert_eq!(err, RecyclerError::DoubleRecycle);
    }

    #[test]
    fn alien_generation_is_rejected() {
        let recycler = Recycler::new(RecyclerConfig { max_capacity: 16 }, || 0u32).unwrap();
        let a = recycler.get();
        let (value, handle, generation) = a.into_parts();
        let err = handle.recycle(value, generation.wrapping_add(1)).unwrap_err();
        assert_eq!(err, RecyclerError::AlienObject);
    }

    #[test]
    fn cross_thread_recycle_surfaces_on_a_later_get() {
        let recycler = Arc::new(Recycler::new(RecyclerConfig { max_capacity: 16 }, || String::new()).unwrap());
        let a = recycler.get();
        let (value, handle, generation) = a.into_parts();

        let (tx, rx) = std::sync::mpsc::channel();
        let t = std::thread::spawn(move || {
            handle.recycle(value, generation).unwrap();
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
        t.join().unwrap();

        // First get after the cross-thread enqueue scavenges it.
        let b = recycler.get();
        b.recycle().unwrap();
    }
}
