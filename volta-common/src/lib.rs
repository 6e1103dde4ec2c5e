//! Common types shared across the volta crates.
//!
//! Identities, message kinds, the counting multiset used by polls and the
//! validator-weight lookup consumed by the throttlers.

pub mod bag;
pub mod error;
pub mod ids;
pub mod message;
pub mod utils;
pub mod validators;

pub use bag::Bag;
pub use error::VoltaError;
pub use ids::{Id, NodeId, RequestId};
pub use message::Op;
pub use validators::{InMemoryValidatorSet, ValidatorSet};
