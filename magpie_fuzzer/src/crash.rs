//! Crash deduplication: one bucket per crash name, with a bounded
//! number of preserved duplicates per bucket.

use magpie_core::HashMap;
use std::sync::Mutex;

pub const MAX_IDENTICAL_CRASHES: u32 = 4;
pub const CRASH_REPRODUCE_TIMES: usize = 10;

#[derive(Debug, Default)]
struct CrashTable {
    num_crashes: u64,
    num_unique_crashes: u64,
    buckets: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct CrashManager {
    max_identical: u32,
    table: Mutex<CrashTable>,
}

impl CrashManager {
    pub fn new(max_identical: u32) -> Self {
        Self {
            max_identical,
            table: Mutex::new(CrashTable::default()),
        }
    }

    /// Count one observed crash. Returns `Some(k)` when the sample
    /// should be preserved as `<name>_<k>`, None once the bucket is
    /// full.
    pub fn register(&self, name: &str) -> Option<u32> {
        let mut table = self.table.lock().unwrap();
        table.num_crashes += 1;
        if let Some(count) = table.buckets.get_mut(name) {
            if *count < self.max_identical {
                *count += 1;
                return Some(*count);
            }
            return None;
        }
        table.buckets.insert(name.to_string(), 1);
        table.num_unique_crashes += 1;
        Some(1)
    }

    pub fn num_crashes(&self) -> u64 {
        self.table.lock().unwrap().num_crashes
    }

    pub fn num_unique_crashes(&self) -> u64 {
        self.table.lock().unwrap().num_unique_crashes
    }

    pub fn saved_count(&self, name: &str) -> u32 {
        self.table
            .lock()
            .unwrap()
            .buckets
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

/// Crash names become file names; keep path separators out of them.
pub fn sanitize_crash_name(name: &str) -> String {
    name.replace('/', "~")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_capped() {
        let crashes = CrashManager::new(3);
        assert_eq!(crashes.register("SIGSEGV_a"), Some(1));
        assert_eq!(crashes.register("SIGSEGV_a"), Some(2));
        assert_eq!(crashes.register("SIGSEGV_a"), Some(3));
        assert_eq!(crashes.register("SIGSEGV_a"), None);
        assert_eq!(crashes.register("SIGSEGV_a"), None);

        assert_eq!(crashes.num_crashes(), 5);
        assert_eq!(crashes.num_unique_crashes(), 1);
        assert_eq!(crashes.saved_count("SIGSEGV_a"), 3);
    }

    #[test]
    fn distinct_names_are_distinct_buckets() {
        let crashes = CrashManager::new(2);
        assert_eq!(crashes.register("SIGSEGV_a"), Some(1));
        assert_eq!(crashes.register("SIGABRT_b"), Some(1));
        assert_eq!(crashes.num_unique_crashes(), 2);
    }

    #[test]
    fn names_are_safe_for_paths() {
        assert_eq!(sanitize_crash_name("crash/in/handler"), "crash~in~handler");
    }
}
