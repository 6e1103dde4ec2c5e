use std::path::Path;

use tracing::info;

use volta_common::NodeId;

use crate::config::Config;
use crate::error::NodeError;

/// Loads the config at `path`, writing a default one there first if it
/// doesn't exist yet.
pub fn ensure_config(path: &str) -> Result<Config, NodeError> {
    if !Path::new(path).exists() {
        info!(path, "config not found, writing defaults");
        let config = Config {
            node_id: NodeId::new(format!("node-{:08x}", rand::random::<u32>())),
            ..Config::default()
        };
        config.save_to_file(path)?;
    }

    let config = Config::load_from_file(path)?;
    config.validate()?;
    Ok(config)
}
