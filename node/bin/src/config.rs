use epoch_prover_broker::{BrokerConfig, BrokerServerConfig};
use epoch_prover_observability::{LogConfig, PrometheusConfig};
use smart_config::{ConfigRepository, ConfigSchema, DeserializeConfig, Environment};

/// Environment variables configuring the node start with this prefix, followed by the
/// section name, e.g. `EPOCH_PROVER_BROKER_JOB_TIMEOUT=45s`.
pub const ENV_PREFIX: &str = "EPOCH_PROVER_";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub broker: BrokerConfig,
    pub server: BrokerServerConfig,
    pub log: LogConfig,
    pub prometheus: PrometheusConfig,
}

impl NodeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut schema = ConfigSchema::default();
        schema.insert(&BrokerConfig::DESCRIPTION, "broker")?;
        schema.insert(&BrokerServerConfig::DESCRIPTION, "server")?;
        schema.insert(&LogConfig::DESCRIPTION, "log")?;
        schema.insert(&PrometheusConfig::DESCRIPTION, "prometheus")?;
        let repo = ConfigRepository::new(&schema).with(Environment::prefixed(ENV_PREFIX));

        Ok(Self {
            broker: parse(&repo)?,
            server: parse(&repo)?,
            log: parse(&repo)?,
            prometheus: parse(&repo)?,
        })
    }
}

fn parse<C: DeserializeConfig>(repo: &ConfigRepository<'_>) -> anyhow::Result<C> {
    repo.single::<C>()?
        .parse()
        .map_err(|errors| anyhow::anyhow!("invalid configuration: {errors}"))
}
