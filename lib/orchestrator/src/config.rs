use epoch_prover_types::EpochNumber;
use smart_config::{DescribeConfig, DeserializeConfig};
use std::time::Duration;

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct OrchestratorConfig {
    /// Compare every proof's public inputs with a proof-free simulation of the same circuit.
    #[config(default_t = true)]
    pub check_simulation_consistency: bool,
    /// Epoch the proving jobs of a tree are enqueued under.
    #[config(default_t = 0)]
    pub epoch_number: EpochNumber,
}

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct FacadeConfig {
    /// How often the broker is asked for newly settled jobs.
    #[config(default_t = Duration::from_secs(1))]
    pub poll_interval: Duration,
    /// How often the status of every outstanding job is reconciled, in case a notification
    /// was missed (e.g. the broker restarted).
    #[config(default_t = Duration::from_secs(10))]
    pub snapshot_sync_interval: Duration,
}
