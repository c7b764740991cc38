use clap::Parser;
use epoch_prover_node::NodeConfig;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Proving job broker. Configured through `EPOCH_PROVER_*` environment variables.
#[derive(Debug, Parser)]
#[command(name = "epoch-prover-broker", version, about)]
struct Cli {
    /// Overrides `EPOCH_PROVER_SERVER_ADDRESS`.
    #[arg(long)]
    address: Option<String>,
    /// Overrides `EPOCH_PROVER_BROKER_DATABASE_PATH`.
    #[arg(long)]
    database_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::from_env()?;
    if let Some(address) = cli.address {
        config.server.address = address;
    }
    if let Some(path) = cli.database_path {
        config.broker.database_path = Some(path);
    }
    config.log.init()?;
    tracing::info!(?config, "starting epoch prover broker");

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("received ctrl-c, shutting down");
            stop.cancel();
        }
    });

    epoch_prover_node::run(config, stop).await
}
