use crate::BrokerError;
use async_trait::async_trait;
use epoch_prover_types::{
    JobLease, JobStatus, ProofUri, ProvingJob, ProvingJobFilter, ProvingJobId, UnixMillis,
};
use std::sync::Arc;

/// Broker API used by whoever needs proofs (the orchestrator's prover facade).
#[async_trait]
pub trait ProvingJobProducer: Send + Sync + 'static {
    /// Idempotent by job id: re-submitting a known job returns its current status.
    async fn enqueue_proving_job(&self, job: ProvingJob) -> Result<JobStatus, BrokerError>;

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> Result<JobStatus, BrokerError>;

    async fn cancel_proving_job(&self, id: &ProvingJobId) -> Result<(), BrokerError>;

    /// Settled jobs among `ids`, plus every job settled since the previous call.
    async fn get_completed_jobs(
        &self,
        ids: &[ProvingJobId],
    ) -> Result<Vec<ProvingJobId>, BrokerError>;

    /// Forgets a settled or cancelled job once its outcome has been consumed.
    async fn clean_up_job(&self, id: &ProvingJobId) -> Result<(), BrokerError>;
}

/// Broker API used by proving agents.
#[async_trait]
pub trait ProvingJobConsumer: Send + Sync + 'static {
    async fn get_proving_job(
        &self,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError>;

    /// Heartbeat. `None` means the caller still owns the job; `Some` is a different job the
    /// caller should switch to.
    async fn report_proving_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: UnixMillis,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError>;

    async fn report_proving_job_success(
        &self,
        id: &ProvingJobId,
        result_ref: ProofUri,
    ) -> Result<(), BrokerError>;

    /// Records a failure. When `filter` is given, the next job for the caller is returned.
    async fn report_proving_job_error(
        &self,
        id: &ProvingJobId,
        reason: String,
        retryable: bool,
        filter: Option<&ProvingJobFilter>,
    ) -> Result<Option<JobLease>, BrokerError>;
}

#[async_trait]
impl<T: ProvingJobProducer + ?Sized> ProvingJobProducer for Arc<T> {
    async fn enqueue_proving_job(&self, job: ProvingJob) -> Result<JobStatus, BrokerError> {
        (**self).enqueue_proving_job(job).await
    }

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> Result<JobStatus, BrokerError> {
        (**self).get_proving_job_status(id).await
    }

    async fn cancel_proving_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        (**self).cancel_proving_job(id).await
    }

    async fn get_completed_jobs(
        &self,
        ids: &[ProvingJobId],
    ) -> Result<Vec<ProvingJobId>, BrokerError> {
        (**self).get_completed_jobs(ids).await
    }

    async fn clean_up_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        (**self).clean_up_job(id).await
    }
}

#[async_trait]
impl<T: ProvingJobConsumer + ?Sized> ProvingJobConsumer for Arc<T> {
    async fn get_proving_job(
        &self,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError> {
        (**self).get_proving_job(filter).await
    }

    async fn report_proving_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: UnixMillis,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError> {
        (**self)
            .report_proving_job_progress(id, started_at, filter)
            .await
    }

    async fn report_proving_job_success(
        &self,
        id: &ProvingJobId,
        result_ref: ProofUri,
    ) -> Result<(), BrokerError> {
        (**self).report_proving_job_success(id, result_ref).await
    }

    async fn report_proving_job_error(
        &self,
        id: &ProvingJobId,
        reason: String,
        retryable: bool,
        filter: Option<&ProvingJobFilter>,
    ) -> Result<Option<JobLease>, BrokerError> {
        (**self)
            .report_proving_job_error(id, reason, retryable, filter)
            .await
    }
}
