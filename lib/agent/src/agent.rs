use crate::config::AgentConfig;
use crate::metrics::AGENT_METRICS;
use epoch_prover_broker::ProvingJobConsumer;
use epoch_prover_proof_store::ProofStore;
use epoch_prover_types::{
    AgentId, JobLease, ProofUri, Prover, ProvingContext, ProvingError, ProvingJob,
    ProvingJobFilter, UnknownRequestType,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Worker that pulls jobs from a broker and proves them with a local [`Prover`].
///
/// Runs `concurrency` independent slots. Each slot heartbeats its current job; when the broker
/// answers a heartbeat with a different job, the current one is abandoned and the slot moves on.
pub struct ProvingAgent {
    consumer: Arc<dyn ProvingJobConsumer>,
    proof_store: Arc<dyn ProofStore>,
    prover: Arc<dyn Prover>,
    config: AgentConfig,
    filter: ProvingJobFilter,
}

enum Outcome {
    Proven(ProofUri),
    Failed(ProvingError),
}

impl ProvingAgent {
    pub fn new(
        consumer: Arc<dyn ProvingJobConsumer>,
        proof_store: Arc<dyn ProofStore>,
        prover: Arc<dyn Prover>,
        config: AgentConfig,
    ) -> Result<Self, UnknownRequestType> {
        let filter = ProvingJobFilter::only(
            AgentId::new(config.agent_id.clone()),
            config.allowed_types()?,
        );
        Ok(Self {
            consumer,
            proof_store,
            prover,
            config,
            filter,
        })
    }

    /// Runs all slots until `shutdown` fires. Jobs in flight at that point are dropped; the
    /// broker hands them out again once they time out.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(
            agent_id = %self.filter.agent_id,
            concurrency,
            allow_list = ?self.filter.allow_list,
            "starting proving agent"
        );
        let slots = (0..concurrency).map(|slot| {
            let agent = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { agent.run_slot(slot, shutdown).await })
        });
        for result in join_all(slots).await {
            if let Err(err) = result {
                tracing::error!(%err, "proving agent slot panicked");
            }
        }
        tracing::info!(agent_id = %self.filter.agent_id, "proving agent stopped");
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        let filter = ProvingJobFilter {
            agent_id: AgentId::new(format!("{}-{slot}", self.filter.agent_id)),
            allow_list: self.filter.allow_list.clone(),
        };
        let mut next: Option<JobLease> = None;
        while !shutdown.is_cancelled() {
            let lease = match next.take() {
                Some(lease) => lease,
                None => match self.consumer.get_proving_job(&filter).await {
                    Ok(Some(lease)) => lease,
                    Ok(None) => {
                        AGENT_METRICS.idle_polls.inc();
                        self.idle(&shutdown).await;
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(agent_id = %filter.agent_id, %err, "failed to fetch proving job");
                        self.idle(&shutdown).await;
                        continue;
                    }
                },
            };
            next = self.process(lease, &filter, &shutdown).await;
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Proves one job while heartbeating it. Returns the job the broker wants this slot to work on
    /// next, if it named one.
    async fn process(
        &self,
        lease: JobLease,
        filter: &ProvingJobFilter,
        shutdown: &CancellationToken,
    ) -> Option<JobLease> {
        let job = &lease.job;
        let job_type = job.ty.as_str();
        AGENT_METRICS.jobs_started[&job_type].inc();
        tracing::info!(job_id = %job.id, job_type, agent_id = %filter.agent_id, "starting proving job");

        let cancel = shutdown.child_token();
        let started = Instant::now();
        let work = self.execute(job, cancel.clone());
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick fires immediately; the lease itself is a fresh heartbeat.
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = heartbeat.tick() => {
                    match self
                        .consumer
                        .report_proving_job_progress(&job.id, lease.started_at, filter)
                        .await
                    {
                        Ok(None) => {}
                        Ok(Some(replacement)) => {
                            cancel.cancel();
                            AGENT_METRICS.jobs_abandoned.inc();
                            tracing::info!(
                                job_id = %job.id,
                                next_job_id = %replacement.job.id,
                                "broker reassigned the slot, abandoning proving job"
                            );
                            return Some(replacement);
                        }
                        Err(err) => {
                            tracing::warn!(job_id = %job.id, %err, "failed to report job progress");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    cancel.cancel();
                    tracing::info!(job_id = %job.id, "shutting down, dropping proving job");
                    return None;
                }
            }
        };

        match outcome {
            Outcome::Proven(result_ref) => {
                AGENT_METRICS.proving_duration[&job_type].observe(started.elapsed());
                match self
                    .consumer
                    .report_proving_job_success(&job.id, result_ref)
                    .await
                {
                    Ok(()) => {
                        AGENT_METRICS.jobs_succeeded[&job_type].inc();
                        tracing::info!(job_id = %job.id, job_type, elapsed = ?started.elapsed(), "proving job succeeded");
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, %err, "failed to report proving job result");
                    }
                }
                None
            }
            Outcome::Failed(ProvingError::Cancelled) if shutdown.is_cancelled() => {
                tracing::info!(job_id = %job.id, "shutting down, dropping proving job");
                None
            }
            Outcome::Failed(err) => {
                AGENT_METRICS.jobs_failed[&job_type].inc();
                let retryable = err.is_retryable();
                tracing::warn!(job_id = %job.id, job_type, retryable, %err, "proving job failed");
                self.consumer
                    .report_proving_job_error(&job.id, err.to_string(), retryable, Some(filter))
                    .await
                    .unwrap_or_else(|err| {
                        tracing::error!(job_id = %job.id, %err, "failed to report proving job error");
                        None
                    })
            }
        }
    }

    async fn execute(&self, job: &ProvingJob, cancel: CancellationToken) -> Outcome {
        match self.try_execute(job, cancel).await {
            Ok(result_ref) => Outcome::Proven(result_ref),
            Err(err) => Outcome::Failed(err),
        }
    }

    async fn try_execute(
        &self,
        job: &ProvingJob,
        cancel: CancellationToken,
    ) -> Result<ProofUri, ProvingError> {
        // Inputs that cannot be loaded will not load on another agent either.
        let request = self
            .proof_store
            .get_proof_input(&job.inputs)
            .await
            .map_err(|err| ProvingError::fatal(format!("cannot load job inputs: {err}")))?;
        if request.request_type() != job.ty {
            return Err(ProvingError::fatal(format!(
                "job of type {} carries {} inputs",
                job.ty,
                request.request_type()
            )));
        }

        let ctx = ProvingContext {
            epoch_number: job.epoch_number,
            cancel: cancel.clone(),
        };
        let output = tokio::select! {
            output = self.prover.prove(request, ctx) => output?,
            _ = cancel.cancelled() => return Err(ProvingError::Cancelled),
        };
        Ok(self
            .proof_store
            .save_proof_output(&job.id, job.ty, &output)
            .await?)
    }
}
