use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::Registry;
use volta_common::{Bag, Id, NodeId};
use volta_consensus::{EarlyTermNoTraversalFactory, PollDriver, PollEvent, QuerySender};
use volta_p2p::{AdaptiveTimeoutConfig, BenchlistConfig, FailureBenchlist, Manager};

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<(NodeId, u32)>>>);

impl Outbox {
    fn drain(&self) -> Vec<(NodeId, u32)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl QuerySender for Outbox {
    fn send_query(&self, node: &NodeId, _chain: Id, request_id: u32) -> bool {
        self.0.lock().unwrap().push((node.clone(), request_id));
        true
    }
}

fn sample() -> Bag<NodeId> {
    ["vdr1", "vdr2", "vdr3"].into_iter().map(NodeId::from).collect()
}

#[tokio::test(start_paused = true)]
async fn test_silent_validator_gets_benched() {
    let registry = Registry::new();
    let benchlist = FailureBenchlist::new(
        BenchlistConfig {
            threshold: 2,
            minimum_failing_duration: Duration::ZERO,
            duration: Duration::from_secs(60),
        },
        "node",
        &registry,
    )
    .unwrap();
    let timeouts = Arc::new(
        Manager::new(
            AdaptiveTimeoutConfig {
                initial_timeout: Duration::from_millis(100),
                minimum_timeout: Duration::from_millis(50),
                maximum_timeout: Duration::from_secs(1),
                timeout_coefficient: 2.0,
                timeout_halflife: Duration::from_secs(10),
            },
            Arc::new(benchlist),
            "node",
            &registry,
        )
        .unwrap(),
    );
    let dispatcher = Arc::clone(&timeouts);
    let dispatch = tokio::spawn(async move { dispatcher.dispatch().await });

    let chain = Id::from_u64(1);
    let outbox = Outbox::default();
    let factory = EarlyTermNoTraversalFactory::new(2).unwrap();
    let mut driver = PollDriver::new(
        chain,
        Box::new(factory),
        Arc::clone(&timeouts),
        outbox.clone(),
        "node",
        &registry,
    )
    .unwrap();
    let events = driver.events();
    let preferred = Id::from_u64(42);

    for _ in 0..2 {
        let (_, immediate) = driver.issue(sample());
        assert!(immediate.is_empty());

        let sent = outbox.drain();
        assert_eq!(sent.len(), 3);
        // vdr3 never answers
        for (node, request_id) in sent.into_iter().filter(|(n, _)| n.as_str() != "vdr3") {
            events.send(PollEvent::chits(request_id, node, preferred)).unwrap();
        }

        let results = driver.next_results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].count(&preferred), 2);
    }

    // let both of vdr3's requests time out
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(timeouts.is_benched(&"vdr3".into(), &chain));
    assert_eq!(timeouts.pending_requests(), 0);

    let (_, immediate) = driver.issue(sample());
    assert!(immediate.is_empty());
    let sent: Vec<NodeId> = outbox.drain().into_iter().map(|(n, _)| n).collect();
    assert_eq!(sent, vec![NodeId::from("vdr1"), NodeId::from("vdr2")]);

    timeouts.stop();
    dispatch.await.unwrap();
}
