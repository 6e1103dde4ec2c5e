use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("couldn't register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}
