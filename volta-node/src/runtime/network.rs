//! network.rs
//!
//! In-process validator set that answers queries after a random delay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::trace;

use volta_common::{Id, NodeId};
use volta_consensus::QuerySender;

use crate::config::SimulationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Responsive,
    /// Takes the query, never answers.
    Silent,
    /// Can't be dialed.
    Unreachable,
}

/// A response off the wire, before it has been admitted by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub node: NodeId,
    pub request_id: u32,
    pub vote: Id,
    pub size: u64,
}

struct NetState {
    rng: StdRng,
    preference: Id,
}

pub struct SimulatedNetwork {
    behaviors: HashMap<NodeId, Behavior>,
    min_latency: Duration,
    max_latency: Duration,
    dissent_probability: f64,
    message_size: u64,
    state: Mutex<NetState>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl SimulatedNetwork {
    pub fn new(
        config: &SimulationConfig,
        behaviors: HashMap<NodeId, Behavior>,
        rng: StdRng,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            behaviors,
            min_latency: config.min_latency,
            max_latency: config.max_latency,
            dissent_probability: config.dissent_probability,
            message_size: config.message_size,
            state: Mutex::new(NetState { rng, preference: Id::EMPTY }),
            inbound,
        }
    }

    /// What responsive validators vote for from now on.
    pub fn set_preference(&self, preference: Id) {
        self.lock().preference = preference;
    }

    pub fn behavior(&self, node: &NodeId) -> Option<Behavior> {
        self.behaviors.get(node).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl QuerySender for SimulatedNetwork {
    fn send_query(&self, node: &NodeId, _chain: Id, request_id: u32) -> bool {
        match self.behavior(node) {
            None | Some(Behavior::Unreachable) => false,
            Some(Behavior::Silent) => {
                trace!(%node, request_id, "query swallowed");
                true
            }
            Some(Behavior::Responsive) => {
                let (latency, vote) = {
                    let mut state = self.lock();
                    let latency = state.rng.gen_range(self.min_latency..=self.max_latency);
                    let vote = if state.rng.gen_bool(self.dissent_probability) {
                        Id::from_bytes(state.rng.gen())
                    } else {
                        state.preference
                    };
                    (latency, vote)
                };

                let msg = Inbound { node: node.clone(), request_id, vote, size: self.message_size };
                let inbound = self.inbound.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    let _ = inbound.send(msg);
                });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn network(behaviors: &[(&str, Behavior)]) -> (SimulatedNetwork, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SimulationConfig { dissent_probability: 0.0, ..Default::default() };
        let behaviors = behaviors.iter().map(|(n, b)| (NodeId::from(*n), *b)).collect();
        (SimulatedNetwork::new(&config, behaviors, StdRng::seed_from_u64(7), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_validator_answers_with_preference() {
        let (net, mut rx) = network(&[("vdr1", Behavior::Responsive)]);
        net.set_preference(Id::from_u64(5));

        assert!(net.send_query(&"vdr1".into(), Id::EMPTY, 3));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.node, NodeId::from("vdr1"));
        assert_eq!(msg.request_id, 3);
        assert_eq!(msg.vote, Id::from_u64(5));
        assert_eq!(msg.size, 512);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulty_validators() {
        let (net, mut rx) = network(&[("silent", Behavior::Silent), ("gone", Behavior::Unreachable)]);

        assert!(net.send_query(&"silent".into(), Id::EMPTY, 0));
        assert!(!net.send_query(&"gone".into(), Id::EMPTY, 0));
        assert!(!net.send_query(&"unknown".into(), Id::EMPTY, 0));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
