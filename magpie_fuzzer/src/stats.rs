//! Session-wide execution counters. Deliberately unlocked: relaxed
//! atomics give workers a cheap increment and the small drift is
//! acceptable for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    total_execs: AtomicU64,
    num_hangs: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_execs(&self) {
        self.total_execs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execs(&self) -> u64 {
        self.total_execs.load(Ordering::Relaxed)
    }

    pub fn set_execs(&self, v: u64) {
        self.total_execs.store(v, Ordering::Relaxed);
    }

    /// Count one hang; returns its ordinal, used to name the preserved
    /// file.
    pub fn inc_hangs(&self) -> u64 {
        self.num_hangs.fetch_add(1, Ordering::Relaxed)
    }

    pub fn hangs(&self) -> u64 {
        self.num_hangs.load(Ordering::Relaxed)
    }
}
