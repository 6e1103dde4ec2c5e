use thiserror::Error;
use volta_p2p::P2pError;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid consensus parameters: {0}")]
    Config(String),

    #[error("couldn't register poll metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    P2p(#[from] P2pError),
}
