// Lease-aware proxy: one atomically replaceable handle shared by all consumers

pub mod drain;

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

pub use drain::{close_within, drain_and_close, DrainOutcome};

/// Holds the active resource handle and replaces it when credentials rotate.
///
/// Consumers keep the proxy for the life of the process and go through it
/// for every operation, so each call lands on whatever handle is active at
/// that moment. A handle obtained from `current()` stays usable after a swap
/// until the rotation policy closes it.
pub struct LeaseAwareProxy<H> {
    active: ArcSwap<H>,
}

impl<H> LeaseAwareProxy<H> {
    pub fn new(initial: H) -> Self {
        Self {
            active: ArcSwap::from_pointee(initial),
        }
    }

    /// Snapshot of the active handle. Never blocks.
    pub fn current(&self) -> Arc<H> {
        self.active.load_full()
    }

    /// Install `next` as the active handle and hand back the one it replaced.
    /// This is the only place the active handle changes.
    pub fn swap(&self, next: Arc<H>) -> Arc<H> {
        self.active.swap(next)
    }

    /// True when `handle` is the one currently installed
    pub fn is_current(&self, handle: &Arc<H>) -> bool {
        Arc::ptr_eq(&self.active.load(), handle)
    }
}

impl<H> fmt::Debug for LeaseAwareProxy<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseAwareProxy").finish_non_exhaustive()
    }
}
