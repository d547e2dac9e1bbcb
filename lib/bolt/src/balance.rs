//! Load balancing across routing-table candidates.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::Address;

/// Source of in-use counts, implemented by the pool. Addresses the pool has
/// never seen count as zero.
pub trait ConnectionCounter {
    fn in_use_connection_count(&self, address: &Address) -> usize;
}

/// Pluggable candidate selection, one choice per role.
pub trait LoadBalancingStrategy: Send + Sync {
    fn select_reader(
        &self,
        counter: &dyn ConnectionCounter,
        candidates: &[Address],
    ) -> Option<Address>;

    fn select_writer(
        &self,
        counter: &dyn ConnectionCounter,
        candidates: &[Address],
    ) -> Option<Address>;
}

/// Least-connected selection with per-role round-robin rotation: the scan
/// starts one further along on every call, so candidates tied on the
/// minimum count are visited in turn before any repeats.
pub struct LeastConnected {
    readers_offset: AtomicUsize,
    writers_offset: AtomicUsize,
}

impl LeastConnected {
    pub fn new() -> LeastConnected {
        LeastConnected {
            readers_offset: AtomicUsize::new(0),
            writers_offset: AtomicUsize::new(0),
        }
    }

    fn select(
        offset: &AtomicUsize,
        counter: &dyn ConnectionCounter,
        candidates: &[Address],
    ) -> Option<Address> {
        if candidates.is_empty() {
            return None;
        }
        let start = offset.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let mut least_connected = None;
        let mut least_in_use = usize::max_value();
        for step in 0..candidates.len() {
            let candidate = &candidates[(start + step) % candidates.len()];
            let in_use = counter.in_use_connection_count(candidate);
            if in_use < least_in_use {
                least_connected = Some(candidate.clone());
                least_in_use = in_use;
            }
        }
        least_connected
    }
}

impl Default for LeastConnected {
    fn default() -> LeastConnected {
        LeastConnected::new()
    }
}

impl LoadBalancingStrategy for LeastConnected {
    fn select_reader(
        &self,
        counter: &dyn ConnectionCounter,
        candidates: &[Address],
    ) -> Option<Address> {
        Self::select(&self.readers_offset, counter, candidates)
    }

    fn select_writer(
        &self,
        counter: &dyn ConnectionCounter,
        candidates: &[Address],
    ) -> Option<Address> {
        Self::select(&self.writers_offset, counter, candidates)
    }
}
