use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use volta_common::NodeId;
use volta_node::{Config, Simulation};
use volta_p2p::{AdaptiveTimeoutConfig, BenchlistConfig};

fn config(validators: usize, unresponsive: usize, unreachable: usize) -> Config {
    let mut config = Config::default();
    config.consensus.k = 5;
    config.consensus.alpha = 3;
    config.simulation.validators = validators;
    config.simulation.unresponsive = unresponsive;
    config.simulation.unreachable = unreachable;
    config.simulation.dissent_probability = 0.0;
    config.simulation.min_latency = Duration::from_millis(10);
    config.simulation.max_latency = Duration::from_millis(10);
    config.timeouts = AdaptiveTimeoutConfig {
        initial_timeout: Duration::from_millis(500),
        minimum_timeout: Duration::from_millis(100),
        maximum_timeout: Duration::from_secs(2),
        timeout_coefficient: 2.0,
        timeout_halflife: Duration::from_secs(30),
    };
    config.benchlist = BenchlistConfig {
        threshold: 1,
        minimum_failing_duration: Duration::ZERO,
        duration: Duration::from_secs(600),
    };
    config
}

#[tokio::test(start_paused = true)]
async fn test_healthy_network_decides_every_poll() {
    let sim = Simulation::new(config(10, 0, 0), &Registry::new()).unwrap();
    let report = sim.run(4, CancellationToken::new()).await.unwrap();

    assert_eq!(report.polls, 4);
    assert_eq!(report.decided, 4);
    assert!(report.benched.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_network_pushes_timeout_up() {
    let sim = Simulation::new(config(3, 0, 3), &Registry::new()).unwrap();
    let report = sim.run(3, CancellationToken::new()).await.unwrap();

    assert_eq!(report.polls, 3);
    assert_eq!(report.decided, 0);
    assert!(report.final_timeout > Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_silent_validator_is_benched() {
    let mut config = config(1, 1, 0);
    config.consensus.k = 1;
    config.consensus.alpha = 1;
    let sim = Simulation::new(config, &Registry::new()).unwrap();

    let report = sim.run(2, CancellationToken::new()).await.unwrap();
    assert_eq!(report.polls, 2);
    assert_eq!(report.decided, 0);
    assert_eq!(report.benched, vec![NodeId::from("vdr-00")]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_early() {
    let sim = Simulation::new(config(10, 0, 0), &Registry::new()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = sim.run(100, cancel).await.unwrap();
    assert_eq!(report.polls, 0);
}
