//! Global memory budget with admission control.
//!
//! The budget never evicts. Once one reservation is refused, every further
//! reservation fails, whatever its size, until memory is released (which
//! only happens when a whole cache instance is dropped).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{info, warn};

#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
    exhausted: AtomicBool,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// A budget that never refuses.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    #[inline]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    /// Whether a reservation was refused since the last release.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Try to account for `bytes` more. Returns `false` (and changes
    /// nothing) if that would exceed the limit or the budget is already
    /// exhausted.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if self.is_exhausted() {
                return false;
            }
            let Some(next) = current.checked_add(bytes).filter(|n| *n <= self.limit) else {
                if !self.exhausted.swap(true, Ordering::AcqRel) {
                    warn!(
                        limit = self.limit,
                        used = current,
                        requested = bytes,
                        "AOT cache memory budget exhausted; refusing new entries"
                    );
                }
                return false;
            };
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` previously reserved.
    pub fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "budget release underflow");
        if self.exhausted.swap(false, Ordering::AcqRel) {
            info!(
                limit = self.limit,
                used = prev - bytes,
                "AOT cache memory budget has room again"
            );
        }
    }
}
