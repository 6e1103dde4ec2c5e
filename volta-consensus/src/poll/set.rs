//! set.rs
//!
//! Live polls keyed by request id.
//!
//! Results are handed back in the order the polls were issued: a poll that
//! finishes early is held until every poll issued before it has finished
//! too, so consumers observe rounds strictly in sequence.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use prometheus::{Histogram, HistogramOpts, IntGauge, Opts, Registry};
use tokio::time::Instant;
use tracing::debug;

use volta_common::{Bag, Id, NodeId};

use super::{Factory, Poll};
use crate::error::ConsensusError;

const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

struct PendingPoll {
    request_id: u32,
    poll: Box<dyn Poll>,
    start: Instant,
}

pub struct Set {
    factory: Box<dyn Factory>,
    /// Issue order -> poll.
    polls: BTreeMap<u64, PendingPoll>,
    /// Request id -> issue order.
    index: HashMap<u32, u64>,
    next_seq: u64,
    num_polls: IntGauge,
    duration: Histogram,
}

impl Set {
    pub fn new(factory: Box<dyn Factory>, namespace: &str, registry: &Registry) -> Result<Self, ConsensusError> {
        let num_polls = IntGauge::with_opts(
            Opts::new("polls", "Number of pending network polls").namespace(namespace),
        )?;
        registry.register(Box::new(num_polls.clone()))?;

        let duration = Histogram::with_opts(
            HistogramOpts::new("poll_duration_seconds", "Time from issuing a poll to releasing its result")
                .namespace(namespace)
                .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            factory,
            polls: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            num_polls,
            duration,
        })
    }

    /// Starts a poll over `vdrs`. Returns `false` if `request_id` is already
    /// in use.
    pub fn add(&mut self, request_id: u32, vdrs: Bag<NodeId>) -> bool {
        if self.index.contains_key(&request_id) {
            debug!(request_id, "dropping poll due to duplicated request id");
            return false;
        }

        debug!(request_id, vdrs = vdrs.len(), "creating poll");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(request_id, seq);
        self.polls.insert(
            seq,
            PendingPoll { request_id, poll: self.factory.new_poll(vdrs), start: Instant::now() },
        );
        self.num_polls.set(self.polls.len() as i64);
        true
    }

    /// Registers `vdr`'s vote in poll `request_id` and returns whatever
    /// results are now ready to release.
    pub fn vote(&mut self, request_id: u32, vdr: &NodeId, vote: Id) -> Vec<Bag<Id>> {
        self.apply(request_id, vdr, |poll| poll.vote(vdr, vote))
    }

    /// Gives up on `vdr` in poll `request_id` and returns whatever results
    /// are now ready to release.
    pub fn drop_vdr(&mut self, request_id: u32, vdr: &NodeId) -> Vec<Bag<Id>> {
        self.apply(request_id, vdr, |poll| poll.drop_vdr(vdr))
    }

    fn apply<F>(&mut self, request_id: u32, vdr: &NodeId, f: F) -> Vec<Bag<Id>>
    where
        F: FnOnce(&mut Box<dyn Poll>),
    {
        let Some(pending) = self.index.get(&request_id).and_then(|seq| self.polls.get_mut(seq)) else {
            debug!(request_id, %vdr, "dropping response for unknown poll");
            return Vec::new();
        };

        f(&mut pending.poll);
        if !pending.poll.finished() {
            return Vec::new();
        }
        debug!(request_id, poll = %pending.poll, "poll finished");
        self.release_finished()
    }

    /// Pops finished polls from the front until the oldest one is still
    /// running.
    pub fn release_finished(&mut self) -> Vec<Bag<Id>> {
        let mut results = Vec::new();
        while let Some(entry) = self.polls.first_entry() {
            if !entry.get().poll.finished() {
                break;
            }
            let pending = entry.remove();
            self.index.remove(&pending.request_id);
            self.duration.observe(pending.start.elapsed().as_secs_f64());
            results.push(pending.poll.result().clone());
        }
        self.num_polls.set(self.polls.len() as i64);
        results
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }
}

impl fmt::Display for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "current polls: ({})", self.polls.len())?;
        for pending in self.polls.values() {
            write!(f, "\n    RequestID {}:\n        {}", pending.request_id, pending.poll)?;
        }
        Ok(())
    }
}
