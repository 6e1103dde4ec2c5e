//! bag.rs
//!
//! A counting multiset over an opaque key type.
//!
//! Polls use two of these: one keyed by validator (how much weight each
//! sampled validator still owes the poll) and one keyed by proposal (how much
//! weight each proposal has received so far).
//!
//! `add`, `remove` and `count` are O(1); `mode` is O(n). When several keys
//! share the maximal count, `mode` returns the one that was inserted first,
//! so two bags built from the same sequence of calls always agree.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: usize,
    // insertion sequence, used to break ties in `mode`
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct Bag<T: Eq + Hash + Clone> {
    counts: HashMap<T, Entry>,
    size: usize,
    next_seq: u64,

    threshold: usize,
    met_threshold: HashSet<T>,
}

impl<T: Eq + Hash + Clone> Default for Bag<T> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            size: 0,
            next_seq: 0,
            threshold: 0,
            met_threshold: HashSet::new(),
        }
    }
}

impl<T: Eq + Hash + Clone> Bag<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bag that tracks which keys reach `threshold` occurrences.
    pub fn with_threshold(threshold: usize) -> Self {
        let mut bag = Self::default();
        bag.set_threshold(threshold);
        bag
    }

    /// Changes the threshold and recomputes the keys that meet it.
    pub fn set_threshold(&mut self, threshold: usize) {
        if self.threshold == threshold {
            return;
        }
        self.threshold = threshold;
        self.met_threshold = self
            .counts
            .iter()
            .filter(|(_, e)| e.count >= threshold)
            .map(|(k, _)| k.clone())
            .collect();
    }

    pub fn add(&mut self, key: T) {
        self.add_count(key, 1);
    }

    /// Adds `count` occurrences of `key`. Adding zero is a no-op.
    pub fn add_count(&mut self, key: T, count: usize) {
        if count == 0 {
            return;
        }

        let seq = self.next_seq;
        let entry = self.counts.entry(key.clone()).or_insert_with(|| Entry { count: 0, seq });
        if entry.seq == seq {
            self.next_seq += 1;
        }
        entry.count += count;
        self.size += count;

        if entry.count >= self.threshold {
            self.met_threshold.insert(key);
        }
    }

    /// Number of occurrences of `key`; zero when it was never added.
    pub fn count(&self, key: &T) -> usize {
        self.counts.get(key).map_or(0, |e| e.count)
    }

    /// Removes every occurrence of `key`.
    pub fn remove(&mut self, key: &T) {
        if let Some(entry) = self.counts.remove(key) {
            self.size -= entry.count;
            self.met_threshold.remove(key);
        }
    }

    /// Total number of occurrences across all keys.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Most frequent key and its count, `None` for an empty bag.
    pub fn mode(&self) -> Option<(&T, usize)> {
        let mut best: Option<(&T, &Entry)> = None;
        for (key, entry) in &self.counts {
            best = match best {
                Some((_, b)) if b.count > entry.count => best,
                Some((_, b)) if b.count == entry.count && b.seq < entry.seq => best,
                _ => Some((key, entry)),
            };
        }
        best.map(|(k, e)| (k, e.count))
    }

    /// Distinct keys, in insertion order.
    pub fn list(&self) -> Vec<T> {
        let mut keys: Vec<(&T, u64)> = self.counts.iter().map(|(k, e)| (k, e.seq)).collect();
        keys.sort_by_key(|(_, seq)| *seq);
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }

    /// Keys whose count has reached the configured threshold.
    pub fn threshold(&self) -> &HashSet<T> {
        &self.met_threshold
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, usize)> {
        self.counts.iter().map(|(k, e)| (k, e.count))
    }

    /// True when both bags hold exactly the same counts.
    pub fn equals(&self, other: &Bag<T>) -> bool {
        self.size == other.size
            && self.counts.len() == other.counts.len()
            && self.counts.iter().all(|(k, e)| other.count(k) == e.count)
    }
}

impl<T: Eq + Hash + Clone> PartialEq for Bag<T> {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl<T: Eq + Hash + Clone> Eq for Bag<T> {}

impl<T: Eq + Hash + Clone> FromIterator<T> for Bag<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut bag = Bag::new();
        for key in iter {
            bag.add(key);
        }
        bag
    }
}

impl<T: Eq + Hash + Clone> Extend<T> for Bag<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for key in iter {
            self.add(key);
        }
    }
}

impl<T: Eq + Hash + Clone + fmt::Display> fmt::Display for Bag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bag: (Size = {})", self.size)?;
        for key in self.list() {
            write!(f, "\n    {}: {}", key, self.count(&key))?;
        }
        Ok(())
    }
}
