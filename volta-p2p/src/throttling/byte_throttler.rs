//! byte_throttler.rs
//!
//! Locking wrapper around [`ByteAllocation`]: looks up validator status,
//! parks callers until bytes are released, and exports pool gauges.
//!
//! [`MsgByteThrottler::acquire_owned`] hands out a [`BytePermit`] that gives
//! its bytes back when dropped, so the permit can travel with the message
//! until whoever processes it is done.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use prometheus::{IntGauge, Opts, Registry};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use volta_common::{NodeId, ValidatorSet};

use crate::error::P2pError;
use crate::throttling::byte_policy::{ByteAllocation, MsgByteThrottlerConfig, Reservation};

struct ByteThrottlerMetrics {
    remaining_vdr_bytes: IntGauge,
    remaining_at_large_bytes: IntGauge,
    awaiting_acquire: IntGauge,
}

impl ByteThrottlerMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self, P2pError> {
        let remaining_vdr_bytes = IntGauge::with_opts(
            Opts::new("byte_throttler_remaining_vdr_bytes", "Bytes left in the validator pool")
                .namespace(namespace),
        )?;
        registry.register(Box::new(remaining_vdr_bytes.clone()))?;

        let remaining_at_large_bytes = IntGauge::with_opts(
            Opts::new("byte_throttler_remaining_at_large_bytes", "Bytes left in the at-large pool")
                .namespace(namespace),
        )?;
        registry.register(Box::new(remaining_at_large_bytes.clone()))?;

        let awaiting_acquire = IntGauge::with_opts(
            Opts::new("byte_throttler_awaiting_acquire", "Number of messages waiting for bytes")
                .namespace(namespace),
        )?;
        registry.register(Box::new(awaiting_acquire.clone()))?;

        Ok(Self { remaining_vdr_bytes, remaining_at_large_bytes, awaiting_acquire })
    }
}

pub struct MsgByteThrottler {
    allocation: Mutex<ByteAllocation>,
    vdrs: Arc<dyn ValidatorSet>,
    released: Notify,
    metrics: ByteThrottlerMetrics,
}

impl MsgByteThrottler {
    pub fn new(
        config: MsgByteThrottlerConfig,
        vdrs: Arc<dyn ValidatorSet>,
        namespace: &str,
        registry: &Registry,
    ) -> Result<Self, P2pError> {
        let allocation = ByteAllocation::new(config)?;
        let metrics = ByteThrottlerMetrics::new(namespace, registry)?;
        let throttler = Self { allocation: Mutex::new(allocation), vdrs, released: Notify::new(), metrics };
        throttler.update_gauges(&throttler.lock());
        Ok(throttler)
    }

    fn lock(&self) -> MutexGuard<'_, ByteAllocation> {
        self.allocation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_gauges(&self, alloc: &ByteAllocation) {
        self.metrics.remaining_vdr_bytes.set(alloc.remaining_vdr_bytes() as i64);
        self.metrics.remaining_at_large_bytes.set(alloc.remaining_at_large_bytes() as i64);
    }

    /// Admits a message of `size` bytes from `node` if there is room now.
    pub fn try_acquire(&self, node: &NodeId, size: u64) -> Option<Reservation> {
        let is_validator = self.vdrs.is_validator(node);
        let mut alloc = self.lock();
        let reservation = alloc.try_acquire(node, size, is_validator)?;
        self.update_gauges(&alloc);
        Some(reservation)
    }

    /// Waits until a message of `size` bytes from `node` can be admitted.
    ///
    /// Returns `None` if `cancel` fires first, or straight away if the
    /// message is bigger than anything the pools could ever hold.
    pub async fn acquire(&self, cancel: &CancellationToken, node: &NodeId, size: u64) -> Option<Reservation> {
        let mut waiting = false;
        let outcome = loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // register before checking so a release in between isn't missed
            released.as_mut().enable();

            let is_validator = self.vdrs.is_validator(node);
            let held = {
                let mut alloc = self.lock();
                if let Some(reservation) = alloc.try_acquire(node, size, is_validator) {
                    self.update_gauges(&alloc);
                    break Some(reservation);
                }
                if !alloc.config().can_ever_fit(size, is_validator) {
                    warn!(%node, size, "message can never fit in the byte throttler");
                    break None;
                }
                alloc.vdr_bytes_used(node) + alloc.at_large_bytes_used(node)
            };

            if !waiting {
                waiting = true;
                self.metrics.awaiting_acquire.inc();
                debug!(%node, size, held, "waiting for message bytes");
            }

            tokio::select! {
                _ = cancel.cancelled() => break None,
                _ = &mut released => {}
            }
        };

        if waiting {
            self.metrics.awaiting_acquire.dec();
        }
        outcome
    }

    /// Like [`Self::acquire`], but the bytes are held by the returned permit
    /// until it is dropped.
    pub async fn acquire_owned(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        node: &NodeId,
        size: u64,
    ) -> Option<BytePermit> {
        let reservation = self.acquire(cancel, node, size).await?;
        Some(BytePermit { throttler: Arc::clone(self), reservation: Some(reservation) })
    }

    pub fn release(&self, reservation: Reservation) {
        {
            let mut alloc = self.lock();
            alloc.release(reservation);
            self.update_gauges(&alloc);
        }
        self.released.notify_waiters();
    }

    pub fn remaining_vdr_bytes(&self) -> u64 {
        self.lock().remaining_vdr_bytes()
    }

    pub fn remaining_at_large_bytes(&self) -> u64 {
        self.lock().remaining_at_large_bytes()
    }
}

/// Bytes held for one unprocessed message. Released on drop.
pub struct BytePermit {
    throttler: Arc<MsgByteThrottler>,
    reservation: Option<Reservation>,
}

impl BytePermit {
    pub fn size(&self) -> u64 {
        self.reservation.as_ref().map_or(0, Reservation::size)
    }

    pub fn is_from_vdr_pool(&self) -> bool {
        self.reservation.as_ref().is_some_and(Reservation::is_from_vdr_pool)
    }
}

impl fmt::Debug for BytePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytePermit").field("reservation", &self.reservation).finish()
    }
}

impl Drop for BytePermit {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.throttler.release(reservation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use volta_common::InMemoryValidatorSet;

    fn throttler() -> (Arc<MsgByteThrottler>, Arc<InMemoryValidatorSet>) {
        let vdrs = Arc::new(InMemoryValidatorSet::new());
        vdrs.add_weight("vdr1".into(), 1);
        let config = MsgByteThrottlerConfig {
            vdr_alloc_size: 100,
            at_large_alloc_size: 50,
            node_max_at_large_bytes: 10,
        };
        let throttler = MsgByteThrottler::new(config, vdrs.clone(), "", &Registry::new()).unwrap();
        (Arc::new(throttler), vdrs)
    }

    #[test]
    fn test_validator_status_is_looked_up() {
        let (throttler, vdrs) = throttler();
        let held = throttler.try_acquire(&"vdr1".into(), 100).unwrap();
        assert_eq!(throttler.remaining_vdr_bytes(), 0);
        assert_eq!(throttler.metrics.remaining_vdr_bytes.get(), 0);

        // same node, no longer staked: limited to its at-large share
        vdrs.remove(&"vdr1".into());
        throttler.release(held);
        assert!(throttler.try_acquire(&"vdr1".into(), 11).is_none());
        assert_eq!(throttler.remaining_vdr_bytes(), 100);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (throttler, _) = throttler();
        let node = NodeId::from("node1");
        let held = throttler.try_acquire(&node, 10).unwrap();

        let waiter = {
            let throttler = Arc::clone(&throttler);
            let node = node.clone();
            tokio::spawn(async move { throttler.acquire(&CancellationToken::new(), &node, 5).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(throttler.metrics.awaiting_acquire.get(), 1);

        throttler.release(held);
        let reservation = waiter.await.unwrap().expect("admitted after release");
        assert_eq!(reservation.size(), 5);
        assert_eq!(throttler.metrics.awaiting_acquire.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled() {
        let (throttler, _) = throttler();
        let node = NodeId::from("node1");
        let _held = throttler.try_acquire(&node, 10).unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        assert!(throttler.acquire(&cancel, &node, 1).await.is_none());
        assert_eq!(throttler.metrics.awaiting_acquire.get(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_never_waits() {
        let (throttler, _) = throttler();
        let reservation = throttler.acquire(&CancellationToken::new(), &"node1".into(), 11).await;
        assert!(reservation.is_none());
    }

    #[tokio::test]
    async fn test_permit_holds_bytes_until_dropped() {
        let (throttler, _) = throttler();
        let node = NodeId::from("vdr1");
        let cancel = CancellationToken::new();

        let permit = throttler.acquire_owned(&cancel, &node, 60).await.unwrap();
        assert_eq!(permit.size(), 60);
        assert_eq!(throttler.remaining_vdr_bytes(), 40);

        let waiter = {
            let throttler = Arc::clone(&throttler);
            let node = node.clone();
            tokio::spawn(async move { throttler.acquire_owned(&CancellationToken::new(), &node, 60).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        let second = waiter.await.unwrap().expect("admitted once the first permit is gone");
        assert_eq!(throttler.remaining_vdr_bytes(), 40);
        drop(second);
        assert_eq!(throttler.remaining_vdr_bytes(), 100);
    }
}
