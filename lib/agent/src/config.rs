use epoch_prover_types::{ProvingRequestType, UnknownRequestType};
use smart_config::{DescribeConfig, DeserializeConfig};
use std::time::Duration;

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct AgentConfig {
    /// Number of jobs proven at the same time.
    #[config(default_t = 1)]
    pub concurrency: usize,
    /// Pause between polls when the broker has nothing for us.
    #[config(default_t = Duration::from_secs(1))]
    pub poll_interval: Duration,
    /// Must be well below the broker's job timeout.
    #[config(default_t = Duration::from_secs(10))]
    pub heartbeat_interval: Duration,
    /// Circuit types this agent proves (e.g. `merge_rollup`). Empty means any.
    #[config(default_t = Vec::new())]
    pub allow_list: Vec<String>,
    /// Prefix of the ids the agent's slots report to the broker.
    #[config(default_t = "proving-agent".into())]
    pub agent_id: String,
}

impl AgentConfig {
    pub fn allowed_types(&self) -> Result<Vec<ProvingRequestType>, UnknownRequestType> {
        self.allow_list.iter().map(|ty| ty.parse()).collect()
    }
}
