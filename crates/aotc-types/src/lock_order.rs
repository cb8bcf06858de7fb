//! Ordered mutexes with a debug-mode lock-order checker.
//!
//! Every lock in the cache belongs to a [`LockLevel`]. A thread may only
//! acquire a lock whose level is strictly greater than every level it already
//! holds; violating the order panics in debug builds. Release builds compile
//! the checker out entirely.

use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use crate::ids::RecordKind;

/// Position of a lock in the global acquisition order.
///
/// Record-kind levels follow [`RecordKind`] order; the artifact map is
/// innermost among the store locks. `ResetOuter` and `ResetInner` bracket
/// the full set when a client deserializer resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    Registry = 0,
    Sessions = 1,
    ResetOuter = 2,
    ClassLoader = 3,
    Class = 4,
    Method = 5,
    ClassChain = 6,
    WellKnownClasses = 7,
    AotHeader = 8,
    Thunk = 9,
    Artifact = 10,
    KnownIds = 11,
    ResetInner = 12,
    SharedPartition = 13,
}

impl LockLevel {
    /// Level of the lock guarding records of `kind`.
    pub const fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::ClassLoader => Self::ClassLoader,
            RecordKind::Class => Self::Class,
            RecordKind::Method => Self::Method,
            RecordKind::ClassChain => Self::ClassChain,
            RecordKind::WellKnownClasses => Self::WellKnownClasses,
            RecordKind::AotHeader => Self::AotHeader,
            RecordKind::Thunk => Self::Thunk,
        }
    }
}

#[cfg(debug_assertions)]
mod checker {
    use std::cell::RefCell;

    use super::LockLevel;

    thread_local! {
        static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.iter().max() {
                assert!(
                    level > top,
                    "lock order violation: acquiring {level:?} while holding {top:?}"
                );
            }
            held.push(level);
        });
    }

    pub(super) fn release(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|l| *l == level) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn held_count() -> usize {
        HELD.with(|held| held.borrow().len())
    }
}

/// A `parking_lot::Mutex` tagged with its place in the lock order.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    #[inline]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    /// Acquire the lock.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the calling thread already holds a lock at
    /// this level or higher.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        checker::acquire(self.level);
        OrderedGuard {
            guard: self.inner.lock(),
            level: self.level,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Number of ordered locks the current thread holds (debug builds only;
/// always 0 in release builds).
pub fn held_lock_count() -> usize {
    #[cfg(debug_assertions)]
    {
        checker::held_count()
    }
    #[cfg(not(debug_assertions))]
    {
        0
    }
}

/// Guard returned by [`OrderedMutex::lock`].
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    level: LockLevel,
}

impl<T> OrderedGuard<'_, T> {
    #[inline]
    pub const fn level(&self) -> LockLevel {
        self.level
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        checker::release(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_levels_follow_kind_order() {
        let levels: Vec<LockLevel> = RecordKind::ALL
            .iter()
            .map(|k| LockLevel::for_kind(*k))
            .collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
        assert!(LockLevel::for_kind(RecordKind::Thunk) < LockLevel::Artifact);
        assert!(LockLevel::ResetOuter < LockLevel::ClassLoader);
        assert!(LockLevel::KnownIds < LockLevel::ResetInner);
    }

    #[test]
    fn test_in_order_nesting_is_allowed() {
        let outer = OrderedMutex::new(LockLevel::ClassLoader, 1_u32);
        let inner = OrderedMutex::new(LockLevel::Artifact, 2_u32);
        {
            let a = outer.lock();
            let mut b = inner.lock();
            *b += *a;
            assert_eq!(b.level(), LockLevel::Artifact);
        }
        assert_eq!(*inner.lock(), 3);
        assert_eq!(held_lock_count(), 0);
    }

    #[test]
    fn test_sequential_reacquire_is_allowed() {
        let m = OrderedMutex::new(LockLevel::Class, ());
        drop(m.lock());
        drop(m.lock());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_out_of_order_acquisition_panics() {
        let artifact = OrderedMutex::new(LockLevel::Artifact, ());
        let class = OrderedMutex::new(LockLevel::Class, ());
        let _held = artifact.lock();
        let _bad = class.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_same_level_nesting_panics() {
        let a = OrderedMutex::new(LockLevel::Method, ());
        let b = OrderedMutex::new(LockLevel::Method, ());
        let _a = a.lock();
        let _b = b.lock();
    }
}
