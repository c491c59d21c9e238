//! The retained corpus: queue entries and the priority queue that hands
//! them out for fuzzing. Lower priority is served first; new samples
//! start at 0 and unproductive fuzzing pushes an entry down the queue.

use crate::mutation::SampleContext;
use crate::sample::Sample;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// One retained corpus member. An entry lives either inside the queue or
/// checked out to exactly one worker; priorities are only mutated while
/// checked out, so re-insertion restores heap order.
#[derive(Debug)]
pub struct SampleQueueEntry {
    pub sample: Arc<Sample>,
    /// Position in `all_samples`, identical to the `%05d` suffix of the
    /// on-disk file.
    pub sample_index: u64,
    /// Mutator state, created lazily the first time the entry is fuzzed.
    pub context: Option<SampleContext>,
    pub priority: f64,
    pub num_runs: u64,
    pub num_newcoverage: u64,
    pub num_hangs: u64,
    pub num_crashes: u64,
}

impl SampleQueueEntry {
    pub fn new(sample: Arc<Sample>, sample_index: u64) -> Self {
        Self {
            sample,
            sample_index,
            context: None,
            priority: 0.0,
            num_runs: 0,
            num_newcoverage: 0,
            num_hangs: 0,
            num_crashes: 0,
        }
    }
}

// BinaryHeap is a max-heap, so compare in reverse to pop the smallest
// priority first.
struct ByPriority(Box<SampleQueueEntry>);

impl PartialEq for ByPriority {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
    }
}

impl Eq for ByPriority {}

impl PartialOrd for ByPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.priority.total_cmp(&self.0.priority)
    }
}

/// Min-priority queue of corpus entries eligible for fuzzing.
#[derive(Default)]
pub struct SampleQueue {
    heap: BinaryHeap<ByPriority>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Box<SampleQueueEntry>) {
        self.heap.push(ByPriority(entry));
    }

    pub fn pop(&mut self) -> Option<Box<SampleQueueEntry>> {
        self.heap.pop().map(|slot| slot.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, priority: f64) -> Box<SampleQueueEntry> {
        let mut e = Box::new(SampleQueueEntry::new(
            Arc::new(Sample::new(vec![index as u8])),
            index,
        ));
        e.priority = priority;
        e
    }

    #[test]
    fn pops_lowest_priority_first() {
        let mut q = SampleQueue::new();
        q.push(entry(0, 0.0));
        q.push(entry(1, -5.0));
        q.push(entry(2, -2.0));
        assert_eq!(q.pop().unwrap().sample_index, 1);
        assert_eq!(q.pop().unwrap().sample_index, 2);
        assert_eq!(q.pop().unwrap().sample_index, 0);
        assert!(q.pop().is_none());
    }

    #[test]
    fn reinsertion_restores_order() {
        let mut q = SampleQueue::new();
        q.push(entry(0, 0.0));
        q.push(entry(1, 0.0));
        let mut e = q.pop().unwrap();
        e.priority = -3.0;
        q.push(e);
        // the demoted entry now outranks the untouched one
        assert_eq!(q.pop().unwrap().priority, -3.0);
        assert_eq!(q.pop().unwrap().priority, 0.0);
    }
}
