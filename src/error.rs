//! Error taxonomy for the arena allocator and the object recycler.
//!
//! Contract violations (double recycle, handles from a foreign pool) are
//! surfaced as `Err` rather than panicking; resource exhaustion is not an
//! error at all (the arena falls back to a fresh chunk, the recycler drops
//! the item) per the exhaustion policy described at each call site.

use thiserror::Error;

/// Errors raised by the arena allocator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    /// A negative capacity, or a capacity exceeding the buffer's maximum,
    /// was requested.
    #[error("invalid capacity requested: {0}")]
    BadRequest(i64),

    /// `free` was called with a handle that does not belong to the chunk
    /// it was passed against. Caller error; never produced internally.
    #[error("handle does not belong to this chunk")]
    ForeignHandle,

    /// The arena's construction parameters violate the invariants in
    /// `ArenaParams::validate`.
    #[error("invalid arena parameters: {0}")]
    InvalidParams(&'static str),
}

/// Errors raised by the per-thread object recycler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecyclerError {
    /// `Handle::recycle` was called with an object that is not the value
    /// the handle was bound to.
    #[error("object does not match the value this handle was issued for")]
    AlienObject,

    /// The handle's `recycleId`/`lastRecycledId` pair indicates it is
    /// already resident in a stack or a cross-thread queue.
    #[error("handle was already recycled once")]
    DoubleRecycle,
}
