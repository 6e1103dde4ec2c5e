//! simulation.rs
//!
//! Drives poll rounds against the simulated network.
//!
//! Every round draws `k` validators by stake, issues one poll through the
//! driver, and waits until the driver releases its result. Finished polls
//! are written to the `consensus` log target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use volta_common::{Bag, Id, InMemoryValidatorSet, NodeId};
use volta_consensus::{EarlyTermNoTraversalFactory, PollDriver};
use volta_p2p::throttling::{DecayingUsageTracker, MsgByteThrottler, ResourceThrottler, TargetUsage};
use volta_p2p::{FailureBenchlist, Manager};

use super::gate::{read_loop, InboundGate};
use super::network::{Behavior, Inbound, SimulatedNetwork};
use crate::config::Config;
use crate::error::NodeError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReport {
    /// Poll results released by the driver.
    pub polls: usize,
    /// Polls whose most voted id reached alpha.
    pub decided: usize,
    pub final_timeout: Duration,
    pub benched: Vec<NodeId>,
}

pub struct Simulation {
    config: Config,
    vdrs: Arc<InMemoryValidatorSet>,
    timeouts: Arc<Manager>,
    network: Arc<SimulatedNetwork>,
    gate: Arc<InboundGate>,
    driver: PollDriver<Arc<SimulatedNetwork>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    rng: StdRng,
}

impl Simulation {
    pub fn new(config: Config, registry: &Registry) -> Result<Self, NodeError> {
        config.validate()?;
        let ns = config.metrics_namespace.as_str();
        let sim = &config.simulation;
        let mut rng = StdRng::from_entropy();

        // first the unreachable validators, then the silent ones
        let vdrs = Arc::new(InMemoryValidatorSet::new());
        let mut behaviors = HashMap::new();
        for i in 0..sim.validators {
            let node = NodeId::new(format!("vdr-{i:02}"));
            let behavior = if i < sim.unreachable {
                Behavior::Unreachable
            } else if i < sim.unreachable + sim.unresponsive {
                Behavior::Silent
            } else {
                Behavior::Responsive
            };
            vdrs.add_weight(node.clone(), rng.gen_range(1..=sim.max_stake));
            behaviors.insert(node, behavior);
        }
        info!(validators = vdrs.len(), unreachable = sim.unreachable, silent = sim.unresponsive, "simulated validator set ready");

        let benchlist = FailureBenchlist::new(config.benchlist.clone(), ns, registry)?;
        let timeouts = Arc::new(Manager::new(config.timeouts.clone(), Arc::new(benchlist), ns, registry)?);

        let tracker = Arc::new(DecayingUsageTracker::new(config.tracker.clone())?);
        let targeter = TargetUsage::new(config.targeter.clone(), vdrs.clone(), tracker.clone())?;
        let system = ResourceThrottler::new(
            config.system_throttler.clone(),
            Arc::new(targeter),
            tracker.clone(),
            ns,
            registry,
        )?;
        let bytes = MsgByteThrottler::new(config.byte_throttler.clone(), vdrs.clone(), ns, registry)?;
        let gate = Arc::new(InboundGate::new(Arc::new(system), Arc::new(bytes), tracker, sim.cpu_per_message));

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let network = Arc::new(SimulatedNetwork::new(
            sim,
            behaviors,
            StdRng::from_rng(&mut rng).map_err(|e| NodeError::Sampling(e.to_string()))?,
            inbound_tx,
        ));

        let factory = EarlyTermNoTraversalFactory::new(config.consensus.alpha)?;
        let driver = PollDriver::new(
            config.consensus.chain_id,
            Box::new(factory),
            Arc::clone(&timeouts),
            Arc::clone(&network),
            ns,
            registry,
        )?;

        Ok(Self { config, vdrs, timeouts, network, gate, driver, inbound, rng })
    }

    /// Runs `rounds` polls, or until `cancel` fires.
    pub async fn run(mut self, rounds: usize, cancel: CancellationToken) -> Result<SimulationReport, NodeError> {
        let dispatcher = Arc::clone(&self.timeouts);
        let dispatch = tokio::spawn(async move { dispatcher.dispatch().await });

        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.gate),
            self.inbound,
            self.driver.events(),
            reader_cancel.clone(),
        ));

        let alpha = self.config.consensus.alpha;
        let mut report = SimulationReport::default();

        for round in 0..rounds {
            if cancel.is_cancelled() {
                break;
            }
            let proposal = Id::from_u64(round as u64 + 1);
            self.network.set_preference(proposal);

            let drawn = sample(&self.vdrs, self.config.consensus.k, &mut self.rng)?;
            let (request_id, results) = self.driver.issue(drawn);
            debug!(round, request_id, %proposal, "issued poll");
            record(&results, alpha, &mut report);

            while self.driver.pending_polls() > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    results = self.driver.next_results() => record(&results, alpha, &mut report),
                }
            }

            // keep handling late chits between rounds so their timeouts are cancelled
            let pause = tokio::time::sleep(self.config.simulation.round_interval);
            tokio::pin!(pause);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut pause => break,
                    results = self.driver.next_results() => record(&results, alpha, &mut report),
                }
            }
        }

        reader_cancel.cancel();
        self.timeouts.stop();
        let _ = reader.await;
        let _ = dispatch.await;

        report.final_timeout = self.timeouts.timeout_duration();
        report.benched = self
            .vdrs
            .list()
            .into_iter()
            .map(|(node, _)| node)
            .filter(|node| self.timeouts.is_benched(node, &self.config.consensus.chain_id))
            .collect();

        info!(
            polls = report.polls,
            decided = report.decided,
            timeout = ?report.final_timeout,
            benched = report.benched.len(),
            "simulation finished"
        );
        Ok(report)
    }
}

/// Draws `k` validators with replacement, weighted by stake.
fn sample(vdrs: &InMemoryValidatorSet, k: usize, rng: &mut StdRng) -> Result<Bag<NodeId>, NodeError> {
    let vdrs = vdrs.list();
    let weights =
        WeightedIndex::new(vdrs.iter().map(|(_, w)| *w)).map_err(|e| NodeError::Sampling(e.to_string()))?;

    let mut sample = Bag::new();
    for _ in 0..k {
        sample.add(vdrs[weights.sample(rng)].0.clone());
    }
    Ok(sample)
}

fn record(results: &[Bag<Id>], alpha: usize, report: &mut SimulationReport) {
    for votes in results {
        report.polls += 1;
        match votes.mode() {
            Some((id, weight)) if weight >= alpha => {
                report.decided += 1;
                info!(target: "consensus", "EVENT:POLL decided={} weight={} votes={}", id, weight, votes.len());
            }
            _ => {
                info!(target: "consensus", "EVENT:POLL undecided votes={}", votes.len());
            }
        }
    }
}
