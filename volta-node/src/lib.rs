pub mod cli;
pub mod config;
pub mod error;
pub mod runtime;
pub mod setup;

pub use config::Config;
pub use error::NodeError;
pub use runtime::simulation::{Simulation, SimulationReport};
