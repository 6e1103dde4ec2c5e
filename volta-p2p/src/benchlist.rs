//! benchlist.rs
//!
//! Temporarily stops querying validators that keep failing to answer.
//!
//! A node is benched on a chain once it has failed `threshold` requests in a
//! row and has been failing for at least `minimum_failing_duration`. It stays
//! benched for `duration`. Any response clears its failure streak.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use prometheus::{IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use volta_common::utils::serde_millis;
use volta_common::{Id, NodeId};

use crate::error::P2pError;

pub trait Benchlist: Send + Sync {
    /// A response arrived from `node` on `chain`.
    fn register_response(&self, chain: &Id, node: &NodeId);

    /// A request to `node` on `chain` timed out.
    fn register_failure(&self, chain: &Id, node: &NodeId);

    fn is_benched(&self, chain: &Id, node: &NodeId) -> bool;
}

/// Benchlist that never benches anyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBenchlist;

impl Benchlist for NoBenchlist {
    fn register_response(&self, _chain: &Id, _node: &NodeId) {}
    fn register_failure(&self, _chain: &Id, _node: &NodeId) {}
    fn is_benched(&self, _chain: &Id, _node: &NodeId) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchlistConfig {
    /// Consecutive failures before a node may be benched.
    pub threshold: usize,
    #[serde(with = "serde_millis")]
    pub minimum_failing_duration: Duration,
    /// How long a benched node stays benched.
    #[serde(with = "serde_millis")]
    pub duration: Duration,
}

impl Default for BenchlistConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            minimum_failing_duration: Duration::from_secs(150),
            duration: Duration::from_secs(15 * 60),
        }
    }
}

impl BenchlistConfig {
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.threshold == 0 {
            return Err(P2pError::Config("benchlist threshold must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FailureStreak {
    consecutive: usize,
    since: Option<Instant>,
}

#[derive(Debug, Default)]
struct BenchState {
    streaks: HashMap<(Id, NodeId), FailureStreak>,
    benched_until: HashMap<(Id, NodeId), Instant>,
}

pub struct FailureBenchlist {
    config: BenchlistConfig,
    state: Mutex<BenchState>,
    benched_num: IntGauge,
}

impl FailureBenchlist {
    pub fn new(config: BenchlistConfig, namespace: &str, registry: &Registry) -> Result<Self, P2pError> {
        config.validate()?;
        let benched_num = IntGauge::with_opts(
            Opts::new("benched_num", "Number of currently benched validators").namespace(namespace),
        )?;
        registry.register(Box::new(benched_num.clone()))?;

        Ok(Self { config, state: Mutex::new(BenchState::default()), benched_num })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops benchings that have run out. Caller holds the lock.
    fn expire(&self, state: &mut BenchState, now: Instant) {
        let before = state.benched_until.len();
        state.benched_until.retain(|_, until| *until > now);
        let expired = before - state.benched_until.len();
        if expired > 0 {
            self.benched_num.sub(expired as i64);
            debug!(expired, "benchings expired");
        }
    }
}

impl Benchlist for FailureBenchlist {
    fn register_response(&self, chain: &Id, node: &NodeId) {
        self.lock().streaks.remove(&(*chain, node.clone()));
    }

    fn register_failure(&self, chain: &Id, node: &NodeId) {
        let now = Instant::now();
        let mut state = self.lock();
        self.expire(&mut state, now);

        let key = (*chain, node.clone());
        if state.benched_until.contains_key(&key) {
            return;
        }

        let streak = state.streaks.entry(key.clone()).or_default();
        streak.consecutive += 1;
        let since = *streak.since.get_or_insert(now);

        if streak.consecutive >= self.config.threshold
            && now.duration_since(since) >= self.config.minimum_failing_duration
        {
            state.streaks.remove(&key);
            state.benched_until.insert(key, now + self.config.duration);
            self.benched_num.inc();
            info!(%node, %chain, duration = ?self.config.duration, "benching validator");
        }
    }

    fn is_benched(&self, chain: &Id, node: &NodeId) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        self.expire(&mut state, now);
        state.benched_until.contains_key(&(*chain, node.clone()))
    }
}
