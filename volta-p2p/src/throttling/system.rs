//! system.rs
//!
//! Rate-limits peers by the system resources their messages consume.
//!
//! Before the next message from a peer is read, [`SystemThrottler::acquire`]
//! waits until the peer's usage has decayed to its target. The wait is
//! re-evaluated at least every `max_recheck_delay`, since usage can fall
//! faster than projected and the target itself can rise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use volta_common::utils::serde_millis;
use volta_common::NodeId;

use crate::error::P2pError;
use crate::throttling::targeter::Targeter;
use crate::throttling::tracker::Tracker;

/// Waits shorter than this are treated as already satisfied.
const EPSILON: Duration = Duration::from_millis(1);

#[async_trait]
pub trait SystemThrottler: Send + Sync {
    /// Blocks until a message from `node` may be read. Returns right away
    /// once `cancel` fires.
    async fn acquire(&self, cancel: &CancellationToken, node: &NodeId);
}

/// Throttler that never waits, used when throttling is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSystemThrottler;

#[async_trait]
impl SystemThrottler for NoSystemThrottler {
    async fn acquire(&self, _cancel: &CancellationToken, _node: &NodeId) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemThrottlerConfig {
    /// Longest we sleep before re-checking whether `acquire` can return.
    #[serde(with = "serde_millis")]
    pub max_recheck_delay: Duration,
}

impl Default for SystemThrottlerConfig {
    fn default() -> Self {
        Self { max_recheck_delay: Duration::from_secs(5) }
    }
}

impl SystemThrottlerConfig {
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.max_recheck_delay.is_zero() {
            return Err(P2pError::Config("max recheck delay must be positive".into()));
        }
        Ok(())
    }
}

struct SystemThrottlerMetrics {
    total_waits: IntCounter,
    total_no_waits: IntCounter,
    awaiting_acquire: IntGauge,
}

impl SystemThrottlerMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self, P2pError> {
        let total_waits = IntCounter::with_opts(
            Opts::new(
                "throttler_total_waits",
                "Number of times we've waited to read a message from a node because their usage was too high",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(total_waits.clone()))?;

        let total_no_waits = IntCounter::with_opts(
            Opts::new(
                "throttler_total_no_waits",
                "Number of times we didn't wait to read a message from a node",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(total_no_waits.clone()))?;

        let awaiting_acquire = IntGauge::with_opts(
            Opts::new(
                "throttler_awaiting_acquire",
                "Number of nodes we're waiting to read a message from because their usage is too high",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(awaiting_acquire.clone()))?;

        Ok(Self { total_waits, total_no_waits, awaiting_acquire })
    }
}

pub struct ResourceThrottler {
    config: SystemThrottlerConfig,
    metrics: SystemThrottlerMetrics,
    targeter: Arc<dyn Targeter>,
    tracker: Arc<dyn Tracker>,
}

impl ResourceThrottler {
    pub fn new(
        config: SystemThrottlerConfig,
        targeter: Arc<dyn Targeter>,
        tracker: Arc<dyn Tracker>,
        namespace: &str,
        registry: &Registry,
    ) -> Result<Self, P2pError> {
        config.validate()?;
        let metrics = SystemThrottlerMetrics::new(namespace, registry)?;
        Ok(Self { config, metrics, targeter, tracker })
    }

    /// How long to sleep before checking again, or `None` if `node` may go.
    fn next_wait(&self, node: &NodeId) -> Option<Duration> {
        let now = Instant::now();
        let target = self.targeter.target_usage(node);
        let usage = self.tracker.usage(node, now);
        if usage <= target {
            return None;
        }

        let wait = self.tracker.time_until_usage(node, now, target);
        if wait < EPSILON {
            return None;
        }
        Some(wait.min(self.config.max_recheck_delay))
    }
}

#[async_trait]
impl SystemThrottler for ResourceThrottler {
    async fn acquire(&self, cancel: &CancellationToken, node: &NodeId) {
        let mut waited = false;

        while let Some(wait) = self.next_wait(node) {
            if !waited {
                waited = true;
                self.metrics.awaiting_acquire.inc();
            }
            trace!(%node, ?wait, "usage above target, waiting");

            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(wait) => false,
            };
            if cancelled {
                break;
            }
        }

        if waited {
            self.metrics.total_waits.inc();
            self.metrics.awaiting_acquire.dec();
        } else {
            self.metrics.total_no_waits.inc();
        }
    }
}
