//! Block-count monitoring over an instrumented resource.

use crate::probe::ProbeResource;

/// Snapshot/delta helper over a [`ProbeResource`]'s block counters.
///
/// A monitor remembers `(blocks_in_use, max_blocks, total_blocks)` at
/// construction (or the latest [`reset`](Self::reset)) and answers
/// whether each has moved since. Byte counters are deliberately not
/// monitored; block counts are what allocation-behavior assertions care
/// about.
///
/// The monitor borrows its resource, so it cannot outlive it or bind to
/// a temporary.
///
/// # Examples
///
/// ```rust
/// use memprobe::{MemoryResource, ProbeMonitor, ProbeResource};
///
/// let probe = ProbeResource::new("monitored");
/// let monitor = ProbeMonitor::new(&probe);
///
/// let ptr = probe.allocate(32, 8).unwrap();
/// assert!(monitor.is_in_use_up());
/// assert_eq!(monitor.delta_blocks_in_use(), 1);
///
/// unsafe { probe.deallocate(ptr.as_ptr(), 32, 8).unwrap() };
/// assert!(monitor.is_in_use_same());
/// assert!(monitor.is_total_up());
/// ```
pub struct ProbeMonitor<'r> {
    initial_in_use: i64,
    initial_max: i64,
    initial_total: i64,
    monitored: &'r ProbeResource<'r>,
}

impl<'r> ProbeMonitor<'r> {
    pub fn new(monitored: &'r ProbeResource<'r>) -> Self {
        Self {
            initial_in_use: monitored.blocks_in_use(),
            initial_max: monitored.max_blocks(),
            initial_total: monitored.total_blocks(),
            monitored,
        }
    }

    /// Re-baselines the monitor on the resource's current counters.
    pub fn reset(&mut self) {
        self.initial_in_use = self.monitored.blocks_in_use();
        self.initial_max = self.monitored.max_blocks();
        self.initial_total = self.monitored.total_blocks();
    }

    pub fn is_in_use_down(&self) -> bool {
        self.monitored.blocks_in_use() < self.initial_in_use
    }

    pub fn is_in_use_same(&self) -> bool {
        self.monitored.blocks_in_use() == self.initial_in_use
    }

    pub fn is_in_use_up(&self) -> bool {
        self.monitored.blocks_in_use() > self.initial_in_use
    }

    pub fn is_max_same(&self) -> bool {
        self.monitored.max_blocks() == self.initial_max
    }

    pub fn is_max_up(&self) -> bool {
        self.monitored.max_blocks() != self.initial_max
    }

    pub fn is_total_same(&self) -> bool {
        self.monitored.total_blocks() == self.initial_total
    }

    pub fn is_total_up(&self) -> bool {
        self.monitored.total_blocks() != self.initial_total
    }

    pub fn delta_blocks_in_use(&self) -> i64 {
        self.monitored.blocks_in_use() - self.initial_in_use
    }

    pub fn delta_max_blocks(&self) -> i64 {
        self.monitored.max_blocks() - self.initial_max
    }

    pub fn delta_total_blocks(&self) -> i64 {
        self.monitored.total_blocks() - self.initial_total
    }
}
