//! byte_policy.rs
//!
//! Accounting for inbound message bytes split across two pools.
//!
//! Validators draw from a reserved pool first so that non-validator traffic
//! can never starve them. Anything that doesn't fit there falls back to the
//! shared at-large pool, where every node, validator or not, is capped at
//! `node_max_at_large_bytes`.
//!
//! [`ByteAllocation`] is plain state. Callers serialize access to it; see
//! [`crate::throttling::MsgByteThrottler`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use volta_common::NodeId;

use crate::error::P2pError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgByteThrottlerConfig {
    /// Bytes reserved for messages from validators.
    pub vdr_alloc_size: u64,
    /// Bytes shared by every other message.
    pub at_large_alloc_size: u64,
    /// Most any single node may hold from the at-large pool.
    pub node_max_at_large_bytes: u64,
}

impl Default for MsgByteThrottlerConfig {
    fn default() -> Self {
        Self {
            vdr_alloc_size: 32 * 1024 * 1024,
            at_large_alloc_size: 6 * 1024 * 1024,
            node_max_at_large_bytes: 2 * 1024 * 1024,
        }
    }
}

impl MsgByteThrottlerConfig {
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.node_max_at_large_bytes > self.at_large_alloc_size {
            return Err(P2pError::Config(format!(
                "per-node at-large cap ({}) exceeds the at-large pool ({})",
                self.node_max_at_large_bytes, self.at_large_alloc_size
            )));
        }
        Ok(())
    }

    /// Whether a message of `size` bytes could ever be admitted, given empty
    /// pools.
    pub fn can_ever_fit(&self, size: u64, is_validator: bool) -> bool {
        (is_validator && size <= self.vdr_alloc_size)
            || size <= self.node_max_at_large_bytes.min(self.at_large_alloc_size)
    }
}

/// Bytes charged for one admitted message. Hand it back to
/// [`ByteAllocation::release`] once the message has been processed.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation holds bytes until it is released"]
pub struct Reservation {
    node: NodeId,
    vdr_bytes: u64,
    at_large_bytes: u64,
}

impl Reservation {
    pub fn size(&self) -> u64 {
        self.vdr_bytes + self.at_large_bytes
    }

    pub fn is_from_vdr_pool(&self) -> bool {
        self.vdr_bytes > 0
    }
}

#[derive(Debug)]
pub struct ByteAllocation {
    config: MsgByteThrottlerConfig,
    remaining_vdr_bytes: u64,
    remaining_at_large_bytes: u64,
    vdr_usage: HashMap<NodeId, u64>,
    at_large_usage: HashMap<NodeId, u64>,
}

impl ByteAllocation {
    pub fn new(config: MsgByteThrottlerConfig) -> Result<Self, P2pError> {
        config.validate()?;
        Ok(Self {
            remaining_vdr_bytes: config.vdr_alloc_size,
            remaining_at_large_bytes: config.at_large_alloc_size,
            vdr_usage: HashMap::new(),
            at_large_usage: HashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &MsgByteThrottlerConfig {
        &self.config
    }

    /// Charges `size` bytes for a message from `node`, or returns `None` if
    /// neither pool can take it right now.
    pub fn try_acquire(&mut self, node: &NodeId, size: u64, is_validator: bool) -> Option<Reservation> {
        if is_validator && self.remaining_vdr_bytes >= size {
            self.remaining_vdr_bytes -= size;
            *self.vdr_usage.entry(node.clone()).or_insert(0) += size;
            return Some(Reservation { node: node.clone(), vdr_bytes: size, at_large_bytes: 0 });
        }

        let used = self.at_large_bytes_used(node);
        if used.saturating_add(size) <= self.config.node_max_at_large_bytes
            && self.remaining_at_large_bytes >= size
        {
            self.remaining_at_large_bytes -= size;
            *self.at_large_usage.entry(node.clone()).or_insert(0) += size;
            return Some(Reservation { node: node.clone(), vdr_bytes: 0, at_large_bytes: size });
        }

        None
    }

    /// Returns exactly what `reservation` charged.
    pub fn release(&mut self, reservation: Reservation) {
        let Reservation { node, vdr_bytes, at_large_bytes } = reservation;
        if vdr_bytes > 0 {
            self.remaining_vdr_bytes = (self.remaining_vdr_bytes + vdr_bytes).min(self.config.vdr_alloc_size);
            give_back(&mut self.vdr_usage, &node, vdr_bytes);
        }
        if at_large_bytes > 0 {
            self.remaining_at_large_bytes =
                (self.remaining_at_large_bytes + at_large_bytes).min(self.config.at_large_alloc_size);
            give_back(&mut self.at_large_usage, &node, at_large_bytes);
        }
    }

    pub fn remaining_vdr_bytes(&self) -> u64 {
        self.remaining_vdr_bytes
    }

    pub fn remaining_at_large_bytes(&self) -> u64 {
        self.remaining_at_large_bytes
    }

    pub fn vdr_bytes_used(&self, node: &NodeId) -> u64 {
        self.vdr_usage.get(node).copied().unwrap_or(0)
    }

    pub fn at_large_bytes_used(&self, node: &NodeId) -> u64 {
        self.at_large_usage.get(node).copied().unwrap_or(0)
    }
}

fn give_back(usage: &mut HashMap<NodeId, u64>, node: &NodeId, bytes: u64) {
    if let Some(used) = usage.get_mut(node) {
        *used = used.saturating_sub(bytes);
        if *used == 0 {
            usage.remove(node);
        }
    }
}
