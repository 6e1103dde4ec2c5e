//! manager.rs
//!
//! Timeout manager the consensus engine talks to: adaptive deadlines plus
//! benchlist bookkeeping and response-latency metrics.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, Registry};
use tracing::debug;

use volta_common::{Id, NodeId, Op, RequestId};

use crate::benchlist::Benchlist;
use crate::error::P2pError;
use crate::timeout::adaptive::{AdaptiveTimeoutConfig, AdaptiveTimeoutManager};

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub struct Manager {
    tm: AdaptiveTimeoutManager,
    benchlist: Arc<dyn Benchlist>,
    chains: Mutex<HashSet<Id>>,
    response_latency: HistogramVec,
}

impl Manager {
    pub fn new(
        config: AdaptiveTimeoutConfig,
        benchlist: Arc<dyn Benchlist>,
        namespace: &str,
        registry: &Registry,
    ) -> Result<Self, P2pError> {
        let tm = AdaptiveTimeoutManager::new(config, namespace, registry)?;

        let response_latency = HistogramVec::new(
            HistogramOpts::new("response_latency_seconds", "Latency of answered requests, by op")
                .namespace(namespace)
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )?;
        registry.register(Box::new(response_latency.clone()))?;

        Ok(Self { tm, benchlist, chains: Mutex::new(HashSet::new()), response_latency })
    }

    /// Fires timeouts until [`Self::stop`] is called. Spawn it on its own task.
    pub async fn dispatch(&self) {
        self.tm.dispatch().await
    }

    pub fn stop(&self) {
        self.tm.stop()
    }

    pub fn timeout_duration(&self) -> Duration {
        self.tm.timeout_duration()
    }

    pub fn register_chain(&self, chain: Id) {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        if chains.insert(chain) {
            debug!(%chain, "registered chain with timeout manager");
        }
    }

    pub fn is_chain_registered(&self, chain: &Id) -> bool {
        self.chains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(chain)
    }

    pub fn is_benched(&self, node: &NodeId, chain: &Id) -> bool {
        self.benchlist.is_benched(chain, node)
    }

    /// Starts the clock on a request. `on_timeout` runs at most once, and
    /// only if neither a response nor [`Self::remove_request`] gets there
    /// first.
    ///
    /// Responses to requests sent to validators flagged unreachable do not
    /// feed the timeout estimate.
    pub fn register_request<F>(
        &self,
        node: NodeId,
        chain: Id,
        is_unreachable_vdr: bool,
        request_id: RequestId,
        on_timeout: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let benchlist = Arc::clone(&self.benchlist);
        let report_failure = request_id.op != Op::AppResponse;
        self.tm.put(request_id, !is_unreachable_vdr, move || {
            if report_failure {
                benchlist.register_failure(&chain, &node);
            }
            on_timeout();
        });
    }

    /// Cancels the timeout of an answered request and folds `latency` into
    /// the timeout estimate. Late or duplicate responses are ignored.
    pub fn register_response(
        &self,
        node: &NodeId,
        chain: &Id,
        request_id: &RequestId,
        op: Op,
        latency: Duration,
    ) {
        if !self.tm.remove(request_id, Some(latency)) {
            return;
        }
        self.response_latency
            .with_label_values(&[op.as_str()])
            .observe(latency.as_secs_f64());
        self.benchlist.register_response(chain, node);
    }

    /// Cancels a request without recording any latency.
    pub fn remove_request(&self, request_id: &RequestId) {
        self.tm.remove(request_id, None);
    }

    /// A query could not be sent at all. Counts as a response that took the
    /// whole current timeout, which drags the estimate upward.
    pub fn register_request_to_unreachable_validator(&self) {
        self.tm.observe_latency(self.tm.timeout_duration());
    }

    pub fn pending_requests(&self) -> usize {
        self.tm.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchlist::{BenchlistConfig, FailureBenchlist, NoBenchlist};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config() -> AdaptiveTimeoutConfig {
        AdaptiveTimeoutConfig {
            initial_timeout: Duration::from_millis(1),
            minimum_timeout: Duration::from_millis(1),
            maximum_timeout: Duration::from_secs(10),
            timeout_coefficient: 1.25,
            timeout_halflife: Duration::from_secs(5 * 60),
        }
    }

    fn spawn_manager(benchlist: Arc<dyn Benchlist>) -> Arc<Manager> {
        let manager = Arc::new(Manager::new(config(), benchlist, "", &Registry::new()).unwrap());
        let dispatcher = Arc::clone(&manager);
        tokio::spawn(async move { dispatcher.dispatch().await });
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_fire() {
        let manager = spawn_manager(Arc::new(NoBenchlist));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let node = NodeId::from("node1");
        let rid = RequestId::new(node.clone(), Id::EMPTY, 1, Op::Chits);
        manager.register_request(node, Id::EMPTY, false, rid, move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_millis(50), rx)
            .await
            .expect("timeout did not fire")
            .unwrap();
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_cancel() {
        let manager = spawn_manager(Arc::new(NoBenchlist));
        let fired = Arc::new(AtomicBool::new(false));

        let node = NodeId::from("node1");
        let cancelled = RequestId::new(node.clone(), Id::EMPTY, 1, Op::Chits);
        let flag = Arc::clone(&fired);
        manager.register_request(node.clone(), Id::EMPTY, false, cancelled.clone(), move || {
            flag.store(true, Ordering::SeqCst);
        });
        manager.register_response(&node, &Id::EMPTY, &cancelled, Op::Chits, Duration::from_secs(1));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let other = RequestId::new(node.clone(), Id::EMPTY, 2, Op::Chits);
        manager.register_request(node, Id::EMPTY, false, other, move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        assert!(!fired.load(Ordering::SeqCst), "should have cancelled the function");
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_ignored() {
        let manager = spawn_manager(Arc::new(NoBenchlist));
        let node = NodeId::from("node1");
        let rid = RequestId::new(node.clone(), Id::EMPTY, 1, Op::Chits);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        manager.register_request(node.clone(), Id::EMPTY, false, rid.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let before = manager.timeout_duration();
        manager.register_response(&node, &Id::EMPTY, &rid, Op::Chits, Duration::from_secs(5));
        manager.remove_request(&rid);
        assert_eq!(manager.timeout_duration(), before);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_feed_benchlist() {
        let benchlist = Arc::new(
            FailureBenchlist::new(
                BenchlistConfig {
                    threshold: 2,
                    minimum_failing_duration: Duration::ZERO,
                    duration: Duration::from_secs(60),
                },
                "",
                &Registry::new(),
            )
            .unwrap(),
        );
        let manager = spawn_manager(benchlist);
        let node = NodeId::from("node1");

        for i in 0..2 {
            let rid = RequestId::new(node.clone(), Id::EMPTY, i, Op::Chits);
            manager.register_request(node.clone(), Id::EMPTY, false, rid, || {});
        }
        // app-level timeouts never count against a node
        let app = RequestId::new("node2".into(), Id::EMPTY, 0, Op::AppResponse);
        manager.register_request("node2".into(), Id::EMPTY, false, app, || {});
        let app = RequestId::new("node2".into(), Id::EMPTY, 1, Op::AppResponse);
        manager.register_request("node2".into(), Id::EMPTY, false, app, || {});

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_benched(&node, &Id::EMPTY));
        assert!(!manager.is_benched(&"node2".into(), &Id::EMPTY));
        manager.stop();
    }

    #[tokio::test]
    async fn test_unreachable_validator_raises_timeout() {
        let manager = Manager::new(config(), Arc::new(NoBenchlist), "", &Registry::new()).unwrap();
        let before = manager.timeout_duration();
        manager.register_request_to_unreachable_validator();
        assert!(manager.timeout_duration() > before);
    }

    #[test]
    fn test_register_chain() {
        let manager = Manager::new(config(), Arc::new(NoBenchlist), "", &Registry::new()).unwrap();
        let chain = Id::from_u64(9);
        assert!(!manager.is_chain_registered(&chain));
        manager.register_chain(chain);
        assert!(manager.is_chain_registered(&chain));
    }
}
