use thiserror::Error;

use volta_common::VoltaError;
use volta_consensus::ConsensusError;
use volta_p2p::P2pError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Common(#[from] VoltaError),

    #[error(transparent)]
    P2p(#[from] P2pError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("couldn't sample validators: {0}")]
    Sampling(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
