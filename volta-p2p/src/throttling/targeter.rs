//! How much usage each peer is entitled to.
//!
//! A peer's target is a stake-weighted share of the validator allocation plus
//! whatever is left of the at-large allocation, capped per peer:
//!
//! `vdr_alloc · weight / total_weight + min(max(0, max_non_vdr_usage − total_usage), max_non_vdr_node_usage)`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use volta_common::{NodeId, ValidatorSet};

use crate::error::P2pError;
use crate::throttling::tracker::Tracker;

pub trait Targeter: Send + Sync {
    fn target_usage(&self, node: &NodeId) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargeterConfig {
    /// Usage reserved for validators, split by stake.
    pub vdr_alloc: f64,
    /// Usage any peer may draw on, validator or not.
    pub max_non_vdr_usage: f64,
    /// Cap on what one peer may take from the at-large usage.
    pub max_non_vdr_node_usage: f64,
}

impl Default for TargeterConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get()) as f64;
        Self {
            vdr_alloc: cpus,
            max_non_vdr_usage: 0.8 * cpus,
            max_non_vdr_node_usage: cpus / 8.0,
        }
    }
}

impl TargeterConfig {
    pub fn validate(&self) -> Result<(), P2pError> {
        for (name, value) in [
            ("vdrAlloc", self.vdr_alloc),
            ("maxNonVdrUsage", self.max_non_vdr_usage),
            ("maxNonVdrNodeUsage", self.max_non_vdr_node_usage),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(P2pError::Config(format!(
                    "{} must be a non-negative number but got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

pub struct TargetUsage {
    config: TargeterConfig,
    vdrs: Arc<dyn ValidatorSet>,
    tracker: Arc<dyn Tracker>,
}

impl TargetUsage {
    pub fn new(
        config: TargeterConfig,
        vdrs: Arc<dyn ValidatorSet>,
        tracker: Arc<dyn Tracker>,
    ) -> Result<Self, P2pError> {
        config.validate()?;
        Ok(Self { config, vdrs, tracker })
    }
}

impl Targeter for TargetUsage {
    fn target_usage(&self, node: &NodeId) -> f64 {
        let usage = self.tracker.total_usage(Instant::now());
        let base_alloc = (self.config.max_non_vdr_usage - usage)
            .max(0.0)
            .min(self.config.max_non_vdr_node_usage);

        let total_weight = self.vdrs.total_weight();
        let vdr_alloc = match self.vdrs.weight(node) {
            Some(weight) if total_weight > 0 => {
                weight as f64 / total_weight as f64 * self.config.vdr_alloc
            }
            _ => 0.0,
        };
        vdr_alloc + base_alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttling::tracker::{DecayingUsageTracker, TrackerConfig};
    use std::time::Duration;
    use volta_common::InMemoryValidatorSet;

    fn setup() -> (Arc<InMemoryValidatorSet>, Arc<DecayingUsageTracker>, TargetUsage) {
        let vdrs = Arc::new(InMemoryValidatorSet::new());
        let tracker = Arc::new(
            DecayingUsageTracker::new(TrackerConfig { halflife: Duration::from_secs(3600) }).unwrap(),
        );
        let config = TargeterConfig { vdr_alloc: 10.0, max_non_vdr_usage: 4.0, max_non_vdr_node_usage: 2.0 };
        let targeter = TargetUsage::new(config, vdrs.clone(), tracker.clone()).unwrap();
        (vdrs, tracker, targeter)
    }

    #[test]
    fn test_validator_gets_stake_share() {
        let (vdrs, _, targeter) = setup();
        vdrs.add_weight("vdr1".into(), 1);
        vdrs.add_weight("vdr2".into(), 3);

        // 10 * 1/4 + min(4, 2)
        assert!((targeter.target_usage(&"vdr1".into()) - 4.5).abs() < 1e-9);
        // 10 * 3/4 + 2
        assert!((targeter.target_usage(&"vdr2".into()) - 9.5).abs() < 1e-9);
        // non-validators only get the at-large share
        assert!((targeter.target_usage(&"peer".into()) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_at_large_share_shrinks_with_total_usage() {
        let (_, tracker, targeter) = setup();
        tracker.record(&"busy".into(), 3.0, Instant::now());
        // max(0, 4 - 3) = 1 < 2
        assert!((targeter.target_usage(&"peer".into()) - 1.0).abs() < 1e-3);

        tracker.record(&"busy".into(), 10.0, Instant::now());
        assert!(targeter.target_usage(&"peer".into()).abs() < 1e-3);
    }

    #[test]
    fn test_negative_config_rejected() {
        let config = TargeterConfig { vdr_alloc: -1.0, ..Default::default() };
        let vdrs: Arc<dyn ValidatorSet> = Arc::new(InMemoryValidatorSet::new());
        let tracker: Arc<dyn Tracker> =
            Arc::new(DecayingUsageTracker::new(TrackerConfig::default()).unwrap());
        assert!(TargetUsage::new(config, vdrs, tracker).is_err());
    }
}
