//! Proving job broker: a shared queue matching proving jobs to agents.
//!
//! Producers enqueue jobs and poll for outcomes; agents pick jobs, heartbeat while proving and
//! report results. The broker owns retries and timeouts, and records every job in a
//! [`ProvingJobDatabase`] so a restart neither loses work nor proves finished jobs again.

mod broker;
mod config;
pub mod database;
mod error;
pub mod http;
mod metrics;
mod queue;
mod traits;

pub use broker::{BrokerStatus, ProvingBroker};
pub use config::{BrokerConfig, BrokerServerConfig};
pub use database::{InMemoryDatabase, JobOutcome, ProvingJobDatabase, RocksDbDatabase, StoredJob};
pub use error::BrokerError;
pub use http::ProvingBrokerClient;
pub use traits::{ProvingJobConsumer, ProvingJobProducer};

use std::sync::Arc;

/// Opens the database selected by `config` and restores the broker from it.
pub fn open_broker(config: BrokerConfig) -> Result<Arc<ProvingBroker>, BrokerError> {
    let database: Arc<dyn ProvingJobDatabase> = match &config.database_path {
        Some(path) => Arc::new(RocksDbDatabase::open(path)?),
        None => Arc::new(InMemoryDatabase::new()),
    };
    let broker = ProvingBroker::new(config, database);
    broker.start()?;
    Ok(Arc::new(broker))
}
