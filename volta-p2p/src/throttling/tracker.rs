//! Per-peer resource usage.
//!
//! Usage is a meter that decays exponentially with a configured halflife:
//! recording `amount` at `t₀` leaves `amount · 2^{-(t − t₀)/halflife}` at
//! `t`. That makes "how long until usage drops to X" a closed-form answer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use volta_common::utils::serde_millis;
use volta_common::NodeId;

use crate::error::P2pError;

pub trait Tracker: Send + Sync {
    /// Usage attributed to `node` as of `now`.
    fn usage(&self, node: &NodeId, now: Instant) -> f64;

    /// Usage summed over every node as of `now`.
    fn total_usage(&self, now: Instant) -> f64;

    /// How long until `node`'s usage falls to `target`, assuming it uses
    /// nothing more in the meantime. Zero if it is already there.
    fn time_until_usage(&self, node: &NodeId, now: Instant, target: f64) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    #[serde(with = "serde_millis")]
    pub halflife: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { halflife: Duration::from_secs(15) }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.halflife.is_zero() {
            return Err(P2pError::Config("tracker halflife must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Meter {
    value: f64,
    last_updated: Instant,
}

impl Meter {
    fn read(&self, now: Instant, halflife: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_updated).as_secs_f64();
        self.value * (-elapsed / halflife).exp2()
    }
}

#[derive(Debug)]
pub struct DecayingUsageTracker {
    // seconds
    halflife: f64,
    meters: Mutex<HashMap<NodeId, Meter>>,
}

impl DecayingUsageTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, P2pError> {
        config.validate()?;
        Ok(Self { halflife: config.halflife.as_secs_f64(), meters: Mutex::new(HashMap::new()) })
    }

    /// Charges `amount` of usage (e.g. CPU seconds spent on its message) to `node`.
    pub fn record(&self, node: &NodeId, amount: f64, now: Instant) {
        let mut meters = self.lock();
        let meter = meters
            .entry(node.clone())
            .or_insert(Meter { value: 0.0, last_updated: now });
        meter.value = meter.read(now, self.halflife) + amount.max(0.0);
        if now > meter.last_updated {
            meter.last_updated = now;
        }
    }

    /// Forgets `node`, e.g. after it disconnects.
    pub fn remove(&self, node: &NodeId) {
        self.lock().remove(node);
    }

    pub fn tracked_nodes(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Meter>> {
        self.meters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Tracker for DecayingUsageTracker {
    fn usage(&self, node: &NodeId, now: Instant) -> f64 {
        self.lock()
            .get(node)
            .map_or(0.0, |m| m.read(now, self.halflife))
    }

    fn total_usage(&self, now: Instant) -> f64 {
        self.lock().values().map(|m| m.read(now, self.halflife)).sum()
    }

    fn time_until_usage(&self, node: &NodeId, now: Instant, target: f64) -> Duration {
        let usage = self.usage(node, now);
        if usage <= target {
            return Duration::ZERO;
        }
        if target <= 0.0 {
            // decays towards zero but never reaches it
            return Duration::MAX;
        }
        let secs = self.halflife * (usage / target).log2();
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
