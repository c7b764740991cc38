use smart_config::{DescribeConfig, DeserializeConfig};
use std::net::{Ipv4Addr, SocketAddr};
use tokio_util::sync::CancellationToken;
use vise_exporter::MetricsExporter;

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct PrometheusConfig {
    /// Port the metrics are served on. Metrics are not exported when unset.
    #[config(default_t = Some(3312))]
    pub port: Option<u16>,
}

impl PrometheusConfig {
    /// Serves every registered metric until `stop` fires.
    pub async fn run(self, stop: CancellationToken) -> anyhow::Result<()> {
        let Some(port) = self.port else {
            tracing::info!("prometheus exporter disabled");
            stop.cancelled().await;
            return Ok(());
        };
        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let exporter = MetricsExporter::default().with_graceful_shutdown(stop.cancelled_owned());
        let server = exporter.bind(address).await?;
        tracing::info!(address = %server.local_addr(), "serving prometheus metrics");
        server.start().await?;
        Ok(())
    }
}
