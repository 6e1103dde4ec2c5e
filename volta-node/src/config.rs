use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use volta_common::utils::serde_millis;
use volta_common::{Id, NodeId, VoltaError};
use volta_p2p::throttling::{MsgByteThrottlerConfig, SystemThrottlerConfig, TargeterConfig, TrackerConfig};
use volta_p2p::{AdaptiveTimeoutConfig, BenchlistConfig};

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusConfig {
    /// Validators drawn per poll, with replacement.
    pub k: usize,
    /// Vote weight needed to decide a poll.
    pub alpha: usize,
    pub rounds: usize,
    pub chain_id: Id,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self { k: 20, alpha: 15, rounds: 10, chain_id: Id::from_u64(1) }
    }
}

/// Shape of the fake validator set the node polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub validators: usize,
    pub max_stake: u64,
    /// Validators that accept queries but never answer.
    pub unresponsive: usize,
    /// Validators that can't be dialed at all.
    pub unreachable: usize,
    #[serde(with = "serde_millis")]
    pub min_latency: Duration,
    #[serde(with = "serde_millis")]
    pub max_latency: Duration,
    /// Chance that a validator answers with something other than the
    /// round's proposal.
    pub dissent_probability: f64,
    pub message_size: u64,
    /// Usage charged to a peer for each message it sends.
    pub cpu_per_message: f64,
    #[serde(with = "serde_millis")]
    pub round_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            validators: 30,
            max_stake: 100,
            unresponsive: 2,
            unreachable: 1,
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(250),
            dissent_probability: 0.1,
            message_size: 512,
            cpu_per_message: 0.01,
            round_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub node_id: NodeId,
    pub metrics_namespace: String,
    pub consensus: ConsensusConfig,
    pub timeouts: AdaptiveTimeoutConfig,
    pub benchlist: BenchlistConfig,
    pub system_throttler: SystemThrottlerConfig,
    pub tracker: TrackerConfig,
    pub targeter: TargeterConfig,
    pub byte_throttler: MsgByteThrottlerConfig,
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("local"),
            metrics_namespace: "volta".to_string(),
            consensus: ConsensusConfig::default(),
            timeouts: AdaptiveTimeoutConfig::default(),
            benchlist: BenchlistConfig::default(),
            system_throttler: SystemThrottlerConfig::default(),
            tracker: TrackerConfig::default(),
            targeter: TargeterConfig::default(),
            byte_throttler: MsgByteThrottlerConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), NodeError> {
        self.timeouts.validate()?;
        self.benchlist.validate()?;
        self.system_throttler.validate()?;
        self.tracker.validate()?;
        self.targeter.validate()?;
        self.byte_throttler.validate()?;

        let invalid = |msg: String| Err(NodeError::Common(VoltaError::Config(msg)));
        let c = &self.consensus;
        if c.k == 0 {
            return invalid("k must be positive".into());
        }
        if c.alpha == 0 || c.alpha > c.k {
            return invalid(format!("alpha must be in [1, k={}] but got {}", c.k, c.alpha));
        }

        let s = &self.simulation;
        if s.validators == 0 || s.max_stake == 0 {
            return invalid("simulation needs at least one staked validator".into());
        }
        if s.unresponsive + s.unreachable > s.validators {
            return invalid(format!(
                "{} unresponsive + {} unreachable validators exceed the {} simulated",
                s.unresponsive, s.unreachable, s.validators
            ));
        }
        if s.min_latency > s.max_latency {
            return invalid("minLatency exceeds maxLatency".into());
        }
        if !(0.0..=1.0).contains(&s.dissent_probability) {
            return invalid(format!("dissentProbability must be in [0, 1] but got {}", s.dissent_probability));
        }
        if !s.cpu_per_message.is_finite() || s.cpu_per_message < 0.0 {
            return invalid(format!("cpuPerMessage must be non-negative but got {}", s.cpu_per_message));
        }
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), VoltaError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, VoltaError> {
        let json = fs::read_to_string(&path)?;
        let config = serde_json::from_str(&json)?;
        info!(path = %path.as_ref().display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.node_id = NodeId::from("node-a");
        config.consensus.rounds = 3;
        config.targeter = TargeterConfig { vdr_alloc: 4.0, max_non_vdr_usage: 3.2, max_non_vdr_node_usage: 0.5 };
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_json_keys() {
        let value = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(value["consensus"]["k"], 20);
        assert_eq!(value["simulation"]["maxLatency"], 250);
        assert_eq!(value["timeouts"]["initialTimeout"], 5000);
        assert!(value["consensus"]["chainId"].is_string());
    }

    #[test]
    fn test_alpha_above_k_rejected() {
        let mut config = Config::default();
        config.consensus.alpha = config.consensus.k + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_too_many_faulty_validators_rejected() {
        let mut config = Config::default();
        config.simulation.validators = 2;
        config.simulation.unresponsive = 2;
        config.simulation.unreachable = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_config_errors_surface() {
        let mut config = Config::default();
        config.benchlist.threshold = 0;
        assert!(matches!(config.validate(), Err(NodeError::P2p(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, VoltaError::Io(_)));
    }
}
