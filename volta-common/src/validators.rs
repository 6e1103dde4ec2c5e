//! Validator-weight lookup.
//!
//! Throttlers only need to know whether a peer is a validator and how much
//! stake it carries relative to the whole set.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::ids::NodeId;

pub trait ValidatorSet: Send + Sync {
    /// Current stake weight of `node`, or `None` if it is not a validator.
    fn weight(&self, node: &NodeId) -> Option<u64>;

    /// Sum of the weights of every validator.
    fn total_weight(&self) -> u64;

    fn is_validator(&self, node: &NodeId) -> bool {
        self.weight(node).is_some()
    }
}

/// Validator set kept in memory, updated as stake changes.
#[derive(Debug, Default)]
pub struct InMemoryValidatorSet {
    weights: RwLock<HashMap<NodeId, u64>>,
}

impl InMemoryValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `weight` to `node`, registering it if needed. Zero weight is ignored.
    pub fn add_weight(&self, node: NodeId, weight: u64) {
        if weight == 0 {
            return;
        }
        let mut weights = self.weights.write().unwrap_or_else(|e| e.into_inner());
        let entry = weights.entry(node).or_insert(0);
        *entry = entry.saturating_add(weight);
    }

    pub fn remove(&self, node: &NodeId) -> Option<u64> {
        self.weights
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node)
    }

    pub fn len(&self) -> usize {
        self.weights.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every validator and its weight, sorted by node id.
    pub fn list(&self) -> Vec<(NodeId, u64)> {
        let weights = self.weights.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(NodeId, u64)> = weights.iter().map(|(n, w)| (n.clone(), *w)).collect();
        out.sort();
        out
    }
}

impl ValidatorSet for InMemoryValidatorSet {
    fn weight(&self, node: &NodeId) -> Option<u64> {
        self.weights
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .copied()
    }

    fn total_weight(&self) -> u64 {
        self.weights
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .fold(0u64, |acc, w| acc.saturating_add(*w))
    }
}
