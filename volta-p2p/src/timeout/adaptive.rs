//! adaptive.rs
//!
//! Deadline scheduler for outstanding requests.
//!
//! Every request gets `now + current_timeout` as its deadline. The current
//! timeout is `coefficient × average latency`, clamped to the configured
//! bounds, where the average is a halflife-weighted moving average of the
//! latencies reported with responses.
//!
//! Pending deadlines live in a min-heap guarded by the same lock as the
//! request map. Cancelled requests are left in the heap and skipped when
//! they surface, so cancellation stays O(1). A single dispatch loop sleeps
//! until the earliest live deadline and is woken early whenever a request
//! with an earlier deadline is registered.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use volta_common::utils::serde_millis;
use volta_common::RequestId;

use crate::error::P2pError;
use crate::utils::Averager;

pub type TimeoutHandler = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveTimeoutConfig {
    #[serde(with = "serde_millis")]
    pub initial_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub minimum_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub maximum_timeout: Duration,
    /// Timeout is this multiple of the average response latency.
    pub timeout_coefficient: f64,
    /// How long until an observation carries half its original weight.
    #[serde(with = "serde_millis")]
    pub timeout_halflife: Duration,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(5),
            minimum_timeout: Duration::from_secs(2),
            maximum_timeout: Duration::from_secs(10),
            timeout_coefficient: 2.0,
            timeout_halflife: Duration::from_secs(5 * 60),
        }
    }
}

impl AdaptiveTimeoutConfig {
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.timeout_halflife.is_zero() {
            return Err(P2pError::Config("timeout halflife must be positive".into()));
        }
        if self.minimum_timeout > self.maximum_timeout {
            return Err(P2pError::Config(format!(
                "minimum timeout {:?} is above maximum timeout {:?}",
                self.minimum_timeout, self.maximum_timeout
            )));
        }
        if self.initial_timeout > self.maximum_timeout {
            return Err(P2pError::Config(format!(
                "initial timeout {:?} is above maximum timeout {:?}",
                self.initial_timeout, self.maximum_timeout
            )));
        }
        if self.initial_timeout < self.minimum_timeout {
            return Err(P2pError::Config(format!(
                "initial timeout {:?} is below minimum timeout {:?}",
                self.initial_timeout, self.minimum_timeout
            )));
        }
        if self.timeout_coefficient.is_nan() || self.timeout_coefficient < 1.0 {
            return Err(P2pError::Config(format!(
                "timeout coefficient must be >= 1 but got {}",
                self.timeout_coefficient
            )));
        }
        Ok(())
    }
}

struct AdaptiveTimeoutMetrics {
    current_timeout: Gauge,
    average_latency: Gauge,
    pending_timeouts: IntGauge,
    timeouts_fired: IntCounter,
}

impl AdaptiveTimeoutMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self, P2pError> {
        let current_timeout = Gauge::with_opts(
            Opts::new("current_timeout_seconds", "Duration of current network timeout")
                .namespace(namespace),
        )?;
        registry.register(Box::new(current_timeout.clone()))?;

        let average_latency = Gauge::with_opts(
            Opts::new("average_latency_seconds", "Average network latency").namespace(namespace),
        )?;
        registry.register(Box::new(average_latency.clone()))?;

        let pending_timeouts = IntGauge::with_opts(
            Opts::new("pending_timeouts", "Number of pending timeouts").namespace(namespace),
        )?;
        registry.register(Box::new(pending_timeouts.clone()))?;

        let timeouts_fired = IntCounter::with_opts(
            Opts::new("timeouts_fired", "Number of requests that timed out").namespace(namespace),
        )?;
        registry.register(Box::new(timeouts_fired.clone()))?;

        Ok(Self { current_timeout, average_latency, pending_timeouts, timeouts_fired })
    }
}

struct PendingTimeout {
    seq: u64,
    // response latency is folded into the estimate only when set
    measure_latency: bool,
    handler: TimeoutHandler,
}

struct State {
    current_timeout: Duration,
    averager: Averager,
    pending: HashMap<RequestId, PendingTimeout>,
    // (deadline, seq) order; stale entries are skipped on pop
    queue: BinaryHeap<Reverse<(Instant, u64, RequestId)>>,
    next_seq: u64,
}

impl State {
    fn is_live(&self, seq: u64, id: &RequestId) -> bool {
        self.pending.get(id).is_some_and(|p| p.seq == seq)
    }

    /// Earliest deadline that still belongs to a pending request.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq, id))) = self.queue.peek() {
            if self.is_live(*seq, id) {
                return Some(*deadline);
            }
            self.queue.pop();
        }
        None
    }
}

pub struct AdaptiveTimeoutManager {
    config: AdaptiveTimeoutConfig,
    state: Mutex<State>,
    wakeup: Notify,
    stop: CancellationToken,
    metrics: AdaptiveTimeoutMetrics,
}

impl AdaptiveTimeoutManager {
    pub fn new(
        config: AdaptiveTimeoutConfig,
        namespace: &str,
        registry: &Registry,
    ) -> Result<Self, P2pError> {
        config.validate()?;
        let metrics = AdaptiveTimeoutMetrics::new(namespace, registry)?;
        metrics.current_timeout.set(config.initial_timeout.as_secs_f64());
        metrics.average_latency.set(config.initial_timeout.as_secs_f64());

        let state = State {
            current_timeout: config.initial_timeout,
            averager: Averager::new(
                config.initial_timeout.as_secs_f64(),
                config.timeout_halflife,
                Instant::now(),
            ),
            pending: HashMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
        };

        Ok(Self {
            config,
            state: Mutex::new(state),
            wakeup: Notify::new(),
            stop: CancellationToken::new(),
            metrics,
        })
    }

    pub fn timeout_duration(&self) -> Duration {
        self.lock().current_timeout
    }

    /// Number of requests still waiting for a response or a deadline.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a request whose `handler` runs if no response arrives within
    /// the current timeout. Registering an id that is already pending
    /// replaces the earlier request without firing it. After [`Self::stop`]
    /// requests are dropped without being tracked.
    pub fn put<F>(&self, id: RequestId, measure_latency: bool, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stop.is_cancelled() {
            debug!(request = %id, "timeout manager stopped, dropping request");
            return;
        }
        let now = Instant::now();
        let mut state = self.lock();

        let earliest = state.next_deadline();
        let deadline = now + state.current_timeout;
        let seq = state.next_seq;
        state.next_seq += 1;

        let replaced = state
            .pending
            .insert(id.clone(), PendingTimeout { seq, measure_latency, handler: Box::new(handler) })
            .is_some();
        if replaced {
            debug!(request = %id, "replacing pending request with the same id");
        }
        state.queue.push(Reverse((deadline, seq, id)));
        self.metrics.pending_timeouts.set(state.pending.len() as i64);
        drop(state);

        if earliest.map_or(true, |e| deadline < e) {
            self.wakeup.notify_one();
        }
    }

    /// Cancels a pending request. When `latency` is given and the request
    /// measures latency, it is folded into the timeout estimate.
    ///
    /// Returns false if the request was not pending (already answered,
    /// already fired, or never registered).
    pub fn remove(&self, id: &RequestId, latency: Option<Duration>) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(id) else {
            return false;
        };
        self.metrics.pending_timeouts.set(state.pending.len() as i64);

        if let (true, Some(latency)) = (pending.measure_latency, latency) {
            self.observe_locked(&mut state, latency, Instant::now());
        }
        true
    }

    /// Folds a latency sample into the estimate without touching any request.
    pub fn observe_latency(&self, latency: Duration) {
        let mut state = self.lock();
        self.observe_locked(&mut state, latency, Instant::now());
    }

    fn observe_locked(&self, state: &mut State, latency: Duration, now: Instant) {
        state.averager.observe(latency.as_secs_f64(), now);
        let average = state.averager.read();

        let scaled = (self.config.timeout_coefficient * average).max(0.0);
        let timeout = Duration::try_from_secs_f64(scaled).unwrap_or(self.config.maximum_timeout);
        state.current_timeout =
            timeout.clamp(self.config.minimum_timeout, self.config.maximum_timeout);

        self.metrics.average_latency.set(average);
        self.metrics.current_timeout.set(state.current_timeout.as_secs_f64());
        trace!(latency = ?latency, timeout = ?state.current_timeout, "updated network timeout");
    }

    /// Removes every request whose deadline is at or before `now` and hands
    /// back their handlers, along with the next live deadline.
    fn take_expired(&self, now: Instant) -> (Vec<(RequestId, TimeoutHandler)>, Option<Instant>) {
        let mut state = self.lock();
        let mut expired = Vec::new();

        while let Some(deadline) = state.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = state.queue.pop() {
                if let Some(pending) = state.pending.remove(&id) {
                    expired.push((id, pending.handler));
                }
            }
        }

        if !expired.is_empty() {
            self.metrics.timeouts_fired.inc_by(expired.len() as u64);
            self.metrics.pending_timeouts.set(state.pending.len() as i64);
        }
        let next = state.next_deadline();
        (expired, next)
    }

    /// Fires timeouts as their deadlines pass. Runs until [`Self::stop`].
    ///
    /// Handlers run on the dispatching task, outside the lock, so they may
    /// register or cancel requests themselves.
    pub async fn dispatch(&self) {
        debug!("timeout dispatcher started");
        loop {
            let (expired, next_deadline) = self.take_expired(Instant::now());
            for (id, handler) in expired {
                trace!(request = %id, "request timed out");
                handler();
            }

            let sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = sleep => {}
            }
        }
        debug!("timeout dispatcher stopped");
    }

    /// Stops the dispatch loop. Requests still pending never fire.
    pub fn stop(&self) {
        self.stop.cancel();
        let mut state = self.lock();
        state.pending.clear();
        state.queue.clear();
        self.metrics.pending_timeouts.set(0);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
