//! Ranked locks with an explicit per-thread lock context.
//!
//! Every lock used by the solver core has a [`LockType`] rank. A thread may
//! only acquire a lock whose rank is strictly greater than every rank it
//! already holds; that single rule makes deadlocks between the broad phase,
//! body, constraint and active-body locks impossible.
//!
//! The set of held ranks lives in a [`PhysicsLockContext`] that the caller
//! owns and passes by reference to every locking call. A context is `!Sync`:
//! each worker thread creates its own.
//!
//! # Example
//!
//! ```
//! use parking_lot::RwLock;
//! use sim_types::{LockType, PhysicsLockContext, SharedLock, UniqueLock};
//!
//! let query = RwLock::new(0_u32);
//! let update = RwLock::new(());
//! let ctx = PhysicsLockContext::new();
//!
//! {
//!     let value = SharedLock::new(&ctx, &query, LockType::BroadPhaseQuery);
//!     // Higher rank while holding a lower one is fine.
//!     let _update = UniqueLock::new(&ctx, &update, LockType::BroadPhaseUpdate);
//!     assert_eq!(*value, 0);
//!     assert!(ctx.is_held(LockType::BroadPhaseUpdate));
//! }
//! assert_eq!(ctx.held_mask(), 0);
//! ```

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ranks, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum LockType {
    /// Broad-phase query lock (one per tree generation).
    BroadPhaseQuery = 1,
    /// Lock protecting a single body.
    PerBody = 2,
    /// Lock protecting the body array.
    BodiesArray = 4,
    /// Broad-phase structural update lock.
    BroadPhaseUpdate = 8,
    /// Constraint registry lock.
    ConstraintsArray = 16,
    /// Active body list lock.
    ActiveBodiesArray = 32,
}

impl LockType {
    /// Bit of this rank in a held mask.
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// Locks held by the current thread.
#[derive(Debug, Default)]
pub struct PhysicsLockContext {
    held: Cell<u32>,
}

impl PhysicsLockContext {
    /// A context holding nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self { held: Cell::new(0) }
    }

    /// Bit mask of held ranks.
    #[must_use]
    pub fn held_mask(&self) -> u32 {
        self.held.get()
    }

    /// True if a lock of rank `lock_type` is held.
    #[must_use]
    pub fn is_held(&self, lock_type: LockType) -> bool {
        self.held.get() & lock_type.bit() != 0
    }

    /// Record the acquisition of `lock_type`.
    ///
    /// Debug builds assert that the rank is above every held rank.
    pub fn check_lock(&self, lock_type: LockType) {
        let held = self.held.get();
        debug_assert!(
            lock_type.bit() > held,
            "lock order violation: acquiring {lock_type:?} while holding mask {held:#b}"
        );
        self.held.set(held | lock_type.bit());
    }

    /// Record the release of `lock_type`.
    pub fn check_unlock(&self, lock_type: LockType) {
        let held = self.held.get();
        debug_assert!(
            held & lock_type.bit() != 0,
            "releasing {lock_type:?} which is not held"
        );
        self.held.set(held & !lock_type.bit());
    }
}

/// Exclusive guard over a ranked `RwLock`.
#[derive(Debug)]
pub struct UniqueLock<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    ctx: &'a PhysicsLockContext,
    lock_type: LockType,
}

impl<'a, T> UniqueLock<'a, T> {
    /// Acquire `lock` exclusively.
    pub fn new(ctx: &'a PhysicsLockContext, lock: &'a RwLock<T>, lock_type: LockType) -> Self {
        ctx.check_lock(lock_type);
        Self {
            guard: lock.write(),
            ctx,
            lock_type,
        }
    }
}

impl<T> Deref for UniqueLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for UniqueLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for UniqueLock<'_, T> {
    fn drop(&mut self) {
        self.ctx.check_unlock(self.lock_type);
    }
}

/// Shared guard over a ranked `RwLock`.
#[derive(Debug)]
pub struct SharedLock<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    ctx: &'a PhysicsLockContext,
    lock_type: LockType,
}

impl<'a, T> SharedLock<'a, T> {
    /// Acquire `lock` shared.
    pub fn new(ctx: &'a PhysicsLockContext, lock: &'a RwLock<T>, lock_type: LockType) -> Self {
        ctx.check_lock(lock_type);
        Self {
            guard: lock.read(),
            ctx,
            lock_type,
        }
    }
}

impl<T> Deref for SharedLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for SharedLock<'_, T> {
    fn drop(&mut self) {
        self.ctx.check_unlock(self.lock_type);
    }
}

/// Guard over a ranked `Mutex`.
#[derive(Debug)]
pub struct MutexLock<'a, T> {
    guard: MutexGuard<'a, T>,
    ctx: &'a PhysicsLockContext,
    lock_type: LockType,
}

impl<'a, T> MutexLock<'a, T> {
    /// Acquire `lock`.
    pub fn new(ctx: &'a PhysicsLockContext, lock: &'a Mutex<T>, lock_type: LockType) -> Self {
        ctx.check_lock(lock_type);
        Self {
            guard: lock.lock(),
            ctx,
            lock_type,
        }
    }
}

impl<T> Deref for MutexLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MutexLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for MutexLock<'_, T> {
    fn drop(&mut self) {
        self.ctx.check_unlock(self.lock_type);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_track_mask() {
        let ctx = PhysicsLockContext::new();
        let constraints = Mutex::new(vec![1, 2, 3]);
        let active = RwLock::new(());

        {
            let mut list = MutexLock::new(&ctx, &constraints, LockType::ConstraintsArray);
            list.push(4);
            let _active = UniqueLock::new(&ctx, &active, LockType::ActiveBodiesArray);
            assert_eq!(
                ctx.held_mask(),
                LockType::ConstraintsArray.bit() | LockType::ActiveBodiesArray.bit()
            );
        }

        assert_eq!(ctx.held_mask(), 0);
        assert_eq!(constraints.lock().len(), 4);
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = PhysicsLockContext::new();
        let b = PhysicsLockContext::new();
        let lock = RwLock::new(());

        let _first = SharedLock::new(&a, &lock, LockType::BroadPhaseQuery);
        let _second = SharedLock::new(&b, &lock, LockType::BroadPhaseQuery);
        assert!(a.is_held(LockType::BroadPhaseQuery));
        assert!(b.is_held(LockType::BroadPhaseQuery));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_descending_rank_panics_in_debug() {
        let ctx = PhysicsLockContext::new();
        let update = RwLock::new(());
        let query = RwLock::new(());

        let _update = UniqueLock::new(&ctx, &update, LockType::BroadPhaseUpdate);
        let _query = SharedLock::new(&ctx, &query, LockType::BroadPhaseQuery);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_same_rank_twice_panics_in_debug() {
        let ctx = PhysicsLockContext::new();
        let a = RwLock::new(());
        let b = RwLock::new(());

        let _a = SharedLock::new(&ctx, &a, LockType::BroadPhaseQuery);
        let _b = SharedLock::new(&ctx, &b, LockType::BroadPhaseQuery);
    }
}
