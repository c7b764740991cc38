//! Proving broker node: the broker HTTP API, its timeout sweep and the metrics exporter.

pub mod config;

use anyhow::Context as _;
use epoch_prover_broker::{http, open_broker};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use config::NodeConfig;

/// Runs the node until `stop` fires or one of its tasks exits.
pub async fn run(config: NodeConfig, stop: CancellationToken) -> anyhow::Result<()> {
    let broker = open_broker(config.broker).context("failed to open proving broker")?;
    let status = broker.status_summary();
    tracing::info!(
        queued = status.queued,
        in_progress = status.in_progress,
        "proving broker restored"
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(broker.clone().run_timeout_loop(stop.clone()));
    tasks.spawn(http::run(broker, config.server, stop.clone()));
    tasks.spawn(config.prometheus.run(stop.clone()));

    let mut outcome = Ok(());
    while let Some(result) = tasks.join_next().await {
        let result = result.context("node task panicked").and_then(|result| result);
        if !stop.is_cancelled() {
            tracing::error!(?result, "node task exited unexpectedly, shutting down");
            stop.cancel();
        }
        if let Err(err) = result {
            tracing::error!(%err, "node task failed");
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }
    tracing::info!("node stopped");
    outcome
}
