use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::prelude::*;

use volta_node::{cli::Args, setup::ensure_config, Simulation};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let node_name = std::path::Path::new(&args.config_path)
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or("local");

    // poll results go to their own file, everything else to stdout
    std::fs::create_dir_all(&args.log_dir)?;
    let file_appender = tracing_appender::rolling::never(&args.log_dir, format!("consensus-{}.log", node_name));
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let consensus_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() == "consensus"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,volta_node=debug".into()),
        )
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() != "consensus"));

    tracing_subscriber::registry()
        .with(consensus_layer)
        .with(stdout_layer)
        .init();

    info!(config = %args.config_path, "starting volta node");

    let mut config = match ensure_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("couldn't load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(rounds) = args.rounds {
        config.consensus.rounds = rounds;
    }
    let rounds = config.consensus.rounds;
    info!(node = %config.node_id, rounds, k = config.consensus.k, alpha = config.consensus.alpha, "config ready");

    let registry = Registry::new();
    let simulation = Simulation::new(config, &registry)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, finishing current round");
            on_signal.cancel();
        }
    });

    let report = simulation.run(rounds, cancel).await?;
    info!(
        polls = report.polls,
        decided = report.decided,
        final_timeout = ?report.final_timeout,
        benched = ?report.benched,
        "done"
    );

    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    debug!("metrics:\n{}", String::from_utf8_lossy(&buf));
    Ok(())
}
