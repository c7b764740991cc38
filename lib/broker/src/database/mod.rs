//! Durable record of jobs and their outcomes, replayed by the broker on start.

mod memory;
mod rocksdb;

pub use self::memory::InMemoryDatabase;
pub use self::rocksdb::RocksDbDatabase;

use crate::BrokerError;
use epoch_prover_types::{JobStatus, ProofUri, ProvingJob, ProvingJobId};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed { result_ref: ProofUri },
    Failed { reason: String, retryable: bool },
    Cancelled,
}

impl From<JobOutcome> for JobStatus {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed { result_ref } => JobStatus::Completed { result_ref },
            JobOutcome::Failed { reason, retryable } => JobStatus::Failed { reason, retryable },
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredJob {
    pub job: ProvingJob,
    pub outcome: Option<JobOutcome>,
}

/// Writes are synchronous and must be durable once they return `Ok`; the broker applies a
/// transition in memory only after the matching write succeeded.
pub trait ProvingJobDatabase: Debug + Send + Sync + 'static {
    fn add_job(&self, job: &ProvingJob) -> Result<(), BrokerError>;

    fn set_job_result(&self, id: &ProvingJobId, result_ref: &ProofUri) -> Result<(), BrokerError>;

    fn set_job_error(
        &self,
        id: &ProvingJobId,
        reason: &str,
        retryable: bool,
    ) -> Result<(), BrokerError>;

    fn set_job_cancelled(&self, id: &ProvingJobId) -> Result<(), BrokerError>;

    fn delete_job(&self, id: &ProvingJobId) -> Result<(), BrokerError>;

    fn all_jobs(&self) -> Result<Vec<StoredJob>, BrokerError>;
}
