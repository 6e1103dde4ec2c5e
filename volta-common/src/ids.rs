//! ids.rs
//!
//! Identities used by the voting and flow-control core.
//!
//! * [`NodeId`] names a peer (validator or not).
//! * [`Id`] is an opaque 32-byte identifier for proposals (blocks, vertices,
//!   transactions) and chains.
//! * [`RequestId`] uniquely names one outstanding network request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::message::Op;

/// Identity of a peer on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque 32-byte identifier, rendered as hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Id(#[serde(with = "hex::serde")] [u8; 32]);

impl Id {
    pub const EMPTY: Id = Id([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Deterministic identifier whose trailing bytes hold `n`.
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Unique key of one outstanding request.
///
/// Two requests to the same node on the same chain are told apart by the
/// numeric `request_id` and by the operation they expect in return.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    pub node_id: NodeId,
    pub chain_id: Id,
    pub request_id: u32,
    /// Operation expected in response.
    pub op: Op,
}

impl RequestId {
    pub fn new(node_id: NodeId, chain_id: Id, request_id: u32, op: Op) -> Self {
        Self { node_id, chain_id, request_id, op }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.node_id, self.chain_id, self.request_id, self.op
        )
    }
}
