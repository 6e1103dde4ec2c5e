//! Poll bookkeeping for a consensus engine.
//!
//! A round samples `k` validators, asks each for its preference and feeds
//! the answers into a [`poll::Poll`]. The [`driver::PollDriver`] owns every
//! live poll, sends the queries, arms their timeouts and applies chits and
//! failures one at a time from a single queue.

pub mod driver;
pub mod error;
pub mod poll;

pub use driver::{PollDriver, PollEvent, QuerySender};
pub use error::ConsensusError;
pub use poll::{EarlyTermNoTraversalFactory, Factory, NoEarlyTermFactory, Poll, Set};
