//! Local stand-in for a running node: a simulated validator set, the
//! inbound gate every response passes through, and the poll loop.

pub mod gate;
pub mod network;
pub mod simulation;
