use smart_config::{DescribeConfig, DeserializeConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct BrokerConfig {
    /// A job in progress without a heartbeat for this long is handed to another agent.
    #[config(default_t = Duration::from_secs(30))]
    pub job_timeout: Duration,
    /// How often in-progress jobs are checked for expired deadlines.
    #[config(default_t = Duration::from_secs(10))]
    pub timeout_interval: Duration,
    /// Number of times a retryable failure (timeouts included) puts a job back in the queue.
    #[config(default_t = 3)]
    pub max_retries: u32,
    /// RocksDB directory for the job database. Jobs are kept in memory only when unset.
    pub database_path: Option<PathBuf>,
}

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct BrokerServerConfig {
    /// Address the broker HTTP API listens on.
    #[config(default_t = "0.0.0.0:3124".into())]
    pub address: String,
    /// Max request body size in bytes; inline proof URIs carry whole payloads.
    #[config(default_t = 100 * 1024 * 1024)]
    pub body_limit: usize,
}
