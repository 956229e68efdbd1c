//! Runtime tunables.
//!
//! Mirrors the knobs a hosting process sets before starting the
//! scheduler: thread pool sizing, the detached-worker budget, and the
//! idle-collection sampling interval. Kept as a plain struct rather than
//! threaded through individual constructor arguments, the way the
//! database config in this crate's ancestor gathered its own startup
//! knobs into one `Config`.

use serde::Deserialize;

/// Configuration for a [`crate::scheduler::Scheduler`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stack size for each worker thread, in bytes.
    pub stack_size: usize,
    /// Number of workers spun up eagerly at startup.
    pub initial_thread_pool_size: usize,
    /// Hard upper bound on worker threads. `0` means unlimited.
    pub max_thread_pool_size: usize,
    /// Cap on concurrently detached workers. `0` means unlimited.
    pub max_detached_threads: usize,
    /// If the idle-pool low-water mark exceeds this, retire idle workers.
    pub min_waiting_thread_collect: usize,
    /// Iterations between low-water-mark samples.
    pub thread_collection_sample_period: usize,
    /// Fixed capacity of each worker's work-stealing deque (spec.md
    /// §4.1: "capacity is fixed at construction"). A graph that produces
    /// successors faster than workers drain them should be redesigned
    /// to apply its own backpressure before hitting this; overrunning it
    /// aborts the process rather than silently growing the buffer.
    pub queue_allowance: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 1 << 20,
            initial_thread_pool_size: num_cpus::get(),
            max_thread_pool_size: 0,
            max_detached_threads: 0,
            min_waiting_thread_collect: 2,
            thread_collection_sample_period: 1000,
            queue_allowance: 1 << 16,
        }
    }
}

impl RuntimeConfig {
    /// `true` if `n` workers would exceed [`Self::max_thread_pool_size`].
    pub fn exceeds_pool_cap(&self, n: usize) -> bool {
        self.max_thread_pool_size != 0 && n > self.max_thread_pool_size
    }

    /// `true` if `n` detached workers would exceed [`Self::max_detached_threads`].
    pub fn exceeds_detached_cap(&self, n: usize) -> bool {
        self.max_detached_threads != 0 && n > self.max_detached_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_unlimited_pool_cap() {
        let cfg = RuntimeConfig::default();
        assert!(!cfg.exceeds_pool_cap(usize::MAX / 2));
    }

    #[test]
    fn zero_means_unlimited() {
        let cfg = RuntimeConfig {
            max_thread_pool_size: 0,
            ..RuntimeConfig::default()
        };
        assert!(!cfg.exceeds_pool_cap(10_000));
    }

    #[test]
    fn nonzero_cap_is_enforced() {
        let cfg = RuntimeConfig {
            max_thread_pool_size: 4,
            ..RuntimeConfig::default()
        };
        assert!(cfg.exceeds_pool_cap(5));
        assert!(!cfg.exceeds_pool_cap(4));
    }
}
