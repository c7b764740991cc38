use super::{JobOutcome, ProvingJobDatabase, StoredJob};
use crate::BrokerError;
use epoch_prover_types::{ProofUri, ProvingJob, ProvingJobId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Job database that lives as long as the process. Clones share the same rows, which lets
/// tests restart a broker on top of the "persisted" state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    jobs: Arc<Mutex<HashMap<ProvingJobId, StoredJob>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_outcome(&self, id: &ProvingJobId, outcome: JobOutcome) -> Result<(), BrokerError> {
        let mut jobs = self.jobs.lock().unwrap();
        let stored = jobs
            .get_mut(id)
            .ok_or_else(|| BrokerError::JobNotFound(id.clone()))?;
        stored.outcome = Some(outcome);
        Ok(())
    }
}

impl ProvingJobDatabase for InMemoryDatabase {
    fn add_job(&self, job: &ProvingJob) -> Result<(), BrokerError> {
        self.jobs.lock().unwrap().insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                outcome: None,
            },
        );
        Ok(())
    }

    fn set_job_result(&self, id: &ProvingJobId, result_ref: &ProofUri) -> Result<(), BrokerError> {
        self.set_outcome(
            id,
            JobOutcome::Completed {
                result_ref: result_ref.clone(),
            },
        )
    }

    fn set_job_error(
        &self,
        id: &ProvingJobId,
        reason: &str,
        retryable: bool,
    ) -> Result<(), BrokerError> {
        self.set_outcome(
            id,
            JobOutcome::Failed {
                reason: reason.to_owned(),
                retryable,
            },
        )
    }

    fn set_job_cancelled(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.set_outcome(id, JobOutcome::Cancelled)
    }

    fn delete_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.jobs.lock().unwrap().remove(id);
        Ok(())
    }

    fn all_jobs(&self) -> Result<Vec<StoredJob>, BrokerError> {
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }
}
