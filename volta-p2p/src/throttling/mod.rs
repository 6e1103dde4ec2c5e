//! Backpressure on inbound traffic.
//!
//! Two independent gates sit in front of message handling:
//!
//! * [`system`] holds off reading from a peer whose messages have been
//!   using more than its share of CPU, as reported by a [`Tracker`] and
//!   judged against a [`Targeter`].
//! * [`byte_throttler`] caps the unprocessed bytes a peer may have in
//!   flight, splitting the budget per [`byte_policy`] between validators and
//!   everyone else.

pub mod byte_policy;
pub mod byte_throttler;
pub mod system;
pub mod targeter;
pub mod tracker;

pub use byte_policy::{ByteAllocation, MsgByteThrottlerConfig, Reservation};
pub use byte_throttler::{BytePermit, MsgByteThrottler};
pub use system::{NoSystemThrottler, ResourceThrottler, SystemThrottler, SystemThrottlerConfig};
pub use targeter::{TargetUsage, Targeter, TargeterConfig};
pub use tracker::{DecayingUsageTracker, Tracker, TrackerConfig};
