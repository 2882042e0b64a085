use std::collections::{HashMap, HashSet, VecDeque};

/// Bounded, per-partition set of recently seen natural keys.
///
/// Used to skip redundant normalization and persistence work. It is an
/// optimization only: entries get evicted, so idempotent inserts at the
/// persistence gateway remain the correctness backstop.
///
/// EVICTION:
/// - When a partition grows beyond `capacity`, the oldest entries are
///   dropped until `0.8 × capacity` remain.
/// - Insertion order is tracked per partition, so the most recently
///   recorded key always survives eviction.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    partitions: HashMap<String, Partition>,
}

#[derive(Debug, Default)]
struct Partition {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            partitions: HashMap::new(),
        }
    }

    pub fn seen(&self, partition: &str, key: &str) -> bool {
        self.partitions
            .get(partition)
            .is_some_and(|p| p.keys.contains(key))
    }

    /// Adds a key. Returns false if it was already present.
    pub fn record(&mut self, partition: &str, key: &str) -> bool {
        let capacity = self.capacity;
        let p = self.partitions.entry(partition.to_string()).or_default();

        if !p.keys.insert(key.to_string()) {
            return false;
        }
        p.order.push_back(key.to_string());

        if p.keys.len() > capacity {
            let target = eviction_target(capacity);
            while p.keys.len() > target {
                match p.order.pop_front() {
                    Some(old) => {
                        p.keys.remove(&old);
                    }
                    None => break,
                }
            }
        }
        true
    }

    /// Seeds a partition from persisted keys, newest first (the order
    /// the gateway returns them in). Oldest keys are inserted first so
    /// that later eviction drops them before the newest ones.
    pub fn seed<I>(&mut self, partition: &str, newest_first: I)
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: DoubleEndedIterator,
    {
        for key in newest_first.into_iter().rev() {
            self.record(partition, &key);
        }
    }

    pub fn len(&self, partition: &str) -> usize {
        self.partitions.get(partition).map_or(0, |p| p.keys.len())
    }

}

fn eviction_target(capacity: usize) -> usize {
    // 0.8 × capacity, computed in integers, never below one key
    (capacity * 4 / 5).max(1)
}
