//! gate.rs
//!
//! Admission path for inbound responses: wait for the sender's CPU usage to
//! drop to its target, reserve bytes for the message, charge the sender for
//! handling it, then hand it to the poll driver.
//!
//! Each peer gets its own reader that admits one message at a time, so a
//! throttled peer stops being read while the others carry on. The byte
//! permit travels with the message and is only given back once the driver
//! has applied the vote.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use volta_common::NodeId;
use volta_consensus::PollEvent;
use volta_p2p::throttling::{DecayingUsageTracker, MsgByteThrottler, SystemThrottler};

use super::network::Inbound;

pub struct InboundGate {
    system: Arc<dyn SystemThrottler>,
    bytes: Arc<MsgByteThrottler>,
    tracker: Arc<DecayingUsageTracker>,
    cpu_per_message: f64,
}

impl InboundGate {
    pub fn new(
        system: Arc<dyn SystemThrottler>,
        bytes: Arc<MsgByteThrottler>,
        tracker: Arc<DecayingUsageTracker>,
        cpu_per_message: f64,
    ) -> Self {
        Self { system, bytes, tracker, cpu_per_message }
    }

    /// Runs `msg` through both throttlers and forwards it to `events`.
    /// Returns false if it was dropped instead.
    pub async fn admit(
        &self,
        cancel: &CancellationToken,
        msg: Inbound,
        events: &mpsc::UnboundedSender<PollEvent>,
    ) -> bool {
        self.system.acquire(cancel, &msg.node).await;
        if cancel.is_cancelled() {
            return false;
        }

        let Some(permit) = self.bytes.acquire_owned(cancel, &msg.node, msg.size).await else {
            debug!(node = %msg.node, size = msg.size, "dropping message, no byte allocation");
            return false;
        };

        self.tracker.record(&msg.node, self.cpu_per_message, Instant::now());
        trace!(
            node = %msg.node,
            request_id = msg.request_id,
            vdr_pool = permit.is_from_vdr_pool(),
            "admitted response"
        );
        events
            .send(PollEvent::Chits {
                request_id: msg.request_id,
                node: msg.node,
                vote: msg.vote,
                permit: Some(permit),
            })
            .is_ok()
    }

    pub fn bytes(&self) -> &MsgByteThrottler {
        &self.bytes
    }
}

/// Admits one peer's messages in arrival order until its queue closes or
/// `cancel` fires.
async fn peer_loop(
    gate: Arc<InboundGate>,
    node: NodeId,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    events: mpsc::UnboundedSender<PollEvent>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        gate.admit(&cancel, msg, &events).await;
    }
    trace!(%node, "peer reader stopped");
}

/// Routes inbound messages to a reader per peer until `cancel` fires or
/// the network goes away.
pub async fn read_loop(
    gate: Arc<InboundGate>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    events: mpsc::UnboundedSender<PollEvent>,
    cancel: CancellationToken,
) {
    let mut peers: HashMap<NodeId, mpsc::UnboundedSender<Inbound>> = HashMap::new();
    let mut readers = JoinSet::new();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let peer = peers.entry(msg.node.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            readers.spawn(peer_loop(
                Arc::clone(&gate),
                msg.node.clone(),
                rx,
                events.clone(),
                cancel.clone(),
            ));
            tx
        });
        let _ = peer.send(msg);
    }

    drop(peers);
    while readers.join_next().await.is_some() {}
    debug!("inbound reader stopped");
}
