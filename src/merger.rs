//! Binary heap merger.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::record::{compare_keys, Record};

/// Heap entry remembering which run the record came from.
struct HeapEntry {
    record: Record,
    run: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.record, &other.record).then(self.run.cmp(&other.run))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Binary heap merger implementation.
/// Merges multiple runs sorted by key into a single sorted output.
/// Records with equal keys are emitted in run order, so merging stably sorted runs yields the
/// stable sort of their concatenation.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of records,
/// *n* is the number of runs.
pub struct RunMerger {
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<HeapEntry>>,
    runs: Vec<std::vec::IntoIter<Record>>,
    initiated: bool,
}

impl RunMerger {
    /// Creates an instance of a binary heap merger using runs as inputs.
    /// Runs should be sorted by key in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `runs` - Runs to be merged in a single sorted one
    pub fn new<I>(runs: I) -> Self
    where
        I: IntoIterator<Item = Vec<Record>>,
    {
        let runs = Vec::from_iter(runs.into_iter().map(|run| run.into_iter()));
        let items = BinaryHeap::with_capacity(runs.len());

        return RunMerger {
            runs,
            items,
            initiated: false,
        };
    }

    fn advance(&mut self, run: usize) {
        if let Some(record) = self.runs[run].next() {
            self.items.push(Reverse(HeapEntry { record, run }));
        }
    }
}

impl Iterator for RunMerger {
    type Item = Record;

    /// Returns the next record from the runs in ascending key order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            for run in 0..self.runs.len() {
                self.advance(run);
            }
            self.initiated = true;
        }

        let Reverse(entry) = self.items.pop()?;
        self.advance(entry.run);

        return Some(entry.record);
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.items.len() + self.runs.iter().map(|run| run.len()).sum::<usize>();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RunMerger {}
