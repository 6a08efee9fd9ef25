//! Scoped allocation for delegate handles.
//!
//! The host runtime hands each delegate a per-method allocation scope whose
//! lifetime covers every handle produced in it. Delegates allocate their
//! execution state through the scope so the runtime can account for (and
//! bound) what a delegated subgraph holds alive. An [`ArenaBox`] returns its
//! accounting to the scope when dropped, which is also how a handle is
//! finalized: dropping the box is the single release point.

use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("scoped arena capacity of {capacity} live allocations exhausted")]
    Exhausted { capacity: usize },
}

#[derive(Debug, Default)]
struct ArenaInner {
    live: AtomicUsize,
    allocated: AtomicUsize,
    capacity: Option<usize>,
}

/// Allocation scope with live/total accounting and an optional ceiling on
/// concurrently live allocations.
#[derive(Debug, Clone, Default)]
pub struct ScopedArena {
    inner: Arc<ArenaInner>,
}

impl ScopedArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that refuses to hold more than `capacity` live allocations.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                live: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
                capacity: Some(capacity),
            }),
        }
    }

    pub fn alloc<T: Send + 'static>(&self, value: T) -> Result<ArenaBox<T>, ArenaError> {
        loop {
            let live = self.inner.live.load(Ordering::Acquire);
            if let Some(capacity) = self.inner.capacity {
                if live >= capacity {
                    return Err(ArenaError::Exhausted { capacity });
                }
            }
            if self
                .inner
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(ArenaBox {
            value: Box::new(value),
            ticket: ScopeTicket {
                scope: Arc::clone(&self.inner),
            },
        })
    }

    /// Number of allocations currently alive in this scope.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Total allocations ever made in this scope.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

struct ScopeTicket {
    scope: Arc<ArenaInner>,
}

impl Drop for ScopeTicket {
    fn drop(&mut self) {
        self.scope.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owned value accounted against a [`ScopedArena`].
pub struct ArenaBox<T: ?Sized> {
    value: Box<T>,
    ticket: ScopeTicket,
}

impl<T: Any + Send> ArenaBox<T> {
    /// Type-erase for storage behind an opaque handle.
    pub fn erase(self) -> ArenaBox<dyn Any + Send> {
        let ArenaBox { value, ticket } = self;
        ArenaBox {
            value: value as Box<dyn Any + Send>,
            ticket,
        }
    }
}

impl<T: ?Sized> Deref for ArenaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: ?Sized> DerefMut for ArenaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ArenaBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArenaBox").field(&&*self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_tracks_live_and_total() {
        let arena = ScopedArena::new();
        let first = arena.alloc(1u32).unwrap();
        let second = arena.alloc(2u32).unwrap();
        assert_eq!(arena.live(), 2);
        assert_eq!(arena.allocated(), 2);

        drop(first);
        assert_eq!(arena.live(), 1);
        drop(second);
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.allocated(), 2);
    }

    #[test]
    fn capacity_bounds_live_allocations() {
        let arena = ScopedArena::with_capacity(1);
        let held = arena.alloc("held").unwrap();
        assert_eq!(
            arena.alloc("rejected").unwrap_err(),
            ArenaError::Exhausted { capacity: 1 }
        );

        drop(held);
        assert!(arena.alloc("retry").is_ok());
    }

    #[test]
    fn erased_box_keeps_accounting_and_downcasts() {
        let arena = ScopedArena::new();
        let erased = arena.alloc(41u64).unwrap().erase();
        assert_eq!(arena.live(), 1);
        assert_eq!(erased.downcast_ref::<u64>(), Some(&41));
        assert!(erased.downcast_ref::<u32>().is_none());

        drop(erased);
        assert_eq!(arena.live(), 0);
    }
}
