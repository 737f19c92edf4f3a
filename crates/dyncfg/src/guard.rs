//! Per-thread reentrancy protection for pattern evaluation
//!
//! Evaluating a pattern may call lookups that read configuration again. When
//! such a lookup reaches the same resolver on the same thread, the resolver
//! must not interpolate a second time. Each [`ReentrancyGuard`] has a unique id;
//! the ids of guards currently evaluating are kept in thread-local state, so
//! other threads and other resolvers are never affected.

use std::cell::RefCell;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE_GUARDS: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// Identifies one resolver for reentrancy tracking
#[derive(Debug)]
pub struct ReentrancyGuard {
    id: u64,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self {
            id: NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Whether the current thread is inside an evaluation for this guard
    pub fn is_active(&self) -> bool {
        ACTIVE_GUARDS.with(|active| active.borrow().contains(&self.id))
    }

    /// Mark the current thread as evaluating.
    ///
    /// Returns `None` if it already is. The flag is cleared when the returned
    /// scope is dropped, including during unwinding.
    pub fn enter(&self) -> Option<GuardScope> {
        let entered = ACTIVE_GUARDS.with(|active| active.borrow_mut().insert(self.id));
        entered.then(|| GuardScope {
            id: self.id,
            _not_send: PhantomData,
        })
    }

    /// Run `evaluate` under the guard, or return `raw` when reentered
    pub fn evaluate_or_raw<F>(&self, raw: &str, evaluate: F) -> String
    where
        F: FnOnce() -> String,
    {
        match self.enter() {
            Some(_scope) => evaluate(),
            None => raw.to_string(),
        }
    }
}

impl Default for ReentrancyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Active evaluation on the current thread; must be dropped on the same thread
#[derive(Debug)]
pub struct GuardScope {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        // The thread-local may already be gone during thread teardown
        let _ = ACTIVE_GUARDS.try_with(|active| active.borrow_mut().remove(&self.id));
    }
}
