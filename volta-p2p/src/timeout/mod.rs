//! Request deadlines.
//!
//! [`AdaptiveTimeoutManager`] is the scheduler; [`Manager`] puts the benchlist
//! and per-op latency metrics in front of it and is what the engine talks to.

pub mod adaptive;
pub mod manager;

pub use adaptive::{AdaptiveTimeoutConfig, AdaptiveTimeoutManager, TimeoutHandler};
pub use manager::Manager;
