//! driver.rs
//!
//! Issues polls and feeds them responses from a single queue.
//!
//! Polls are never touched from the timeout dispatcher or from network
//! tasks. Chits and timeouts are both turned into [`PollEvent`]s and pushed
//! onto the driver's channel; whoever owns the driver drains it with
//! [`PollDriver::next_results`] or [`PollDriver::handle`].

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use volta_common::{Bag, Id, NodeId, Op, RequestId};
use volta_p2p::throttling::BytePermit;
use volta_p2p::Manager;

use crate::error::ConsensusError;
use crate::poll::{Factory, Set};

#[derive(Debug)]
pub enum PollEvent {
    /// `node` answered poll `request_id` with its preference. `permit` holds
    /// the message's bytes until the vote has been applied.
    Chits { request_id: u32, node: NodeId, vote: Id, permit: Option<BytePermit> },
    /// `node` will not answer poll `request_id`.
    QueryFailed { request_id: u32, node: NodeId },
}

impl PollEvent {
    pub fn chits(request_id: u32, node: NodeId, vote: Id) -> Self {
        PollEvent::Chits { request_id, node, vote, permit: None }
    }
}

/// Outbound side of a poll. Implemented by the network layer.
pub trait QuerySender: Send + Sync {
    /// Sends a query for poll `request_id` to `node`. Returns `false` when
    /// there is no way to reach it.
    fn send_query(&self, node: &NodeId, chain: Id, request_id: u32) -> bool;
}

impl<T: QuerySender + ?Sized> QuerySender for Arc<T> {
    fn send_query(&self, node: &NodeId, chain: Id, request_id: u32) -> bool {
        (**self).send_query(node, chain, request_id)
    }
}

pub struct PollDriver<S> {
    chain: Id,
    polls: Set,
    timeouts: Arc<Manager>,
    sender: S,
    events_tx: mpsc::UnboundedSender<PollEvent>,
    events_rx: mpsc::UnboundedReceiver<PollEvent>,
    next_request_id: u32,
    sent_at: HashMap<RequestId, Instant>,
}

impl<S: QuerySender> PollDriver<S> {
    pub fn new(
        chain: Id,
        factory: Box<dyn Factory>,
        timeouts: Arc<Manager>,
        sender: S,
        namespace: &str,
        registry: &Registry,
    ) -> Result<Self, ConsensusError> {
        let polls = Set::new(factory, namespace, registry)?;
        timeouts.register_chain(chain);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            chain,
            polls,
            timeouts,
            sender,
            events_tx,
            events_rx,
            next_request_id: 0,
            sent_at: HashMap::new(),
        })
    }

    /// Handle the network layer uses to deliver chits.
    pub fn events(&self) -> mpsc::UnboundedSender<PollEvent> {
        self.events_tx.clone()
    }

    pub fn chain(&self) -> Id {
        self.chain
    }

    pub fn pending_polls(&self) -> usize {
        self.polls.len()
    }

    /// Starts a poll over `sample` and queries every validator in it.
    ///
    /// Benched and unreachable validators are dropped from the poll right
    /// away, so the poll may already be finished: any results released by
    /// that are returned alongside the new request id.
    pub fn issue(&mut self, sample: Bag<NodeId>) -> (u32, Vec<Bag<Id>>) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let vdrs = sample.list();
        if !self.polls.add(request_id, sample) {
            return (request_id, Vec::new());
        }

        let mut failed = Vec::new();
        for vdr in vdrs {
            if self.timeouts.is_benched(&vdr, &self.chain) {
                debug!(%vdr, request_id, "not querying benched validator");
                failed.push(vdr);
                continue;
            }
            if !self.sender.send_query(&vdr, self.chain, request_id) {
                warn!(%vdr, request_id, "validator unreachable");
                self.timeouts.register_request_to_unreachable_validator();
                failed.push(vdr);
                continue;
            }

            let rid = RequestId::new(vdr.clone(), self.chain, request_id, Op::Chits);
            self.sent_at.insert(rid.clone(), Instant::now());

            let events = self.events_tx.clone();
            let node = vdr.clone();
            self.timeouts.register_request(vdr, self.chain, false, rid, move || {
                let _ = events.send(PollEvent::QueryFailed { request_id, node });
            });
        }

        let mut results = Vec::new();
        for vdr in failed {
            results.extend(self.polls.drop_vdr(request_id, &vdr));
        }
        // an empty sample finishes without any response
        results.extend(self.polls.release_finished());
        (request_id, results)
    }

    /// Applies one event and returns the results it released.
    pub fn handle(&mut self, event: PollEvent) -> Vec<Bag<Id>> {
        match event {
            PollEvent::Chits { request_id, node, vote, permit } => {
                let rid = RequestId::new(node.clone(), self.chain, request_id, Op::Chits);
                let Some(sent) = self.sent_at.remove(&rid) else {
                    debug!(%node, request_id, "ignoring unexpected chits");
                    return Vec::new();
                };
                self.timeouts
                    .register_response(&node, &self.chain, &rid, Op::Chits, sent.elapsed());
                trace!(%node, request_id, %vote, bytes = permit.as_ref().map_or(0, BytePermit::size), "chits");
                let results = self.polls.vote(request_id, &node, vote);
                drop(permit);
                results
            }
            PollEvent::QueryFailed { request_id, node } => {
                let rid = RequestId::new(node.clone(), self.chain, request_id, Op::Chits);
                self.sent_at.remove(&rid);
                debug!(%node, request_id, "query failed");
                self.polls.drop_vdr(request_id, &node)
            }
        }
    }

    /// Waits for events until at least one poll result is released.
    pub async fn next_results(&mut self) -> Vec<Bag<Id>> {
        // the driver holds a sender, so the channel never closes
        while let Some(event) = self.events_rx.recv().await {
            let results = self.handle(event);
            if !results.is_empty() {
                return results;
            }
        }
        Vec::new()
    }
}
