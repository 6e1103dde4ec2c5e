//! Flow control for the network side of a node.
//!
//! * [`timeout`]: deadlines for outstanding requests, with a timeout duration
//!   that follows observed round-trip latency.
//! * [`benchlist`]: stops querying peers that keep timing out.
//! * [`throttling`]: backpressure on peers whose messages cost too much CPU,
//!   and the byte budget split between validators and everyone else.

pub mod benchlist;
pub mod error;
pub mod throttling;
pub mod timeout;
pub mod utils;

pub use benchlist::{Benchlist, BenchlistConfig, FailureBenchlist, NoBenchlist};
pub use error::P2pError;
pub use timeout::{AdaptiveTimeoutConfig, AdaptiveTimeoutManager, Manager};
