use crate::config::FacadeConfig;
use crate::metrics::FACADE_METRICS;
use crate::slot::SharedResult;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use epoch_prover_broker::{BrokerError, ProvingJobProducer};
use epoch_prover_proof_store::ProofStore;
use epoch_prover_types::{
    Clock, JobStatus, ProofOutput, Prover, ProvingContext, ProvingError, ProvingJob,
    ProvingJobId, ProvingRequest, ProvingRequestType, SystemClock,
};
use futures::future::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PendingJob {
    ty: ProvingRequestType,
    resolve: oneshot::Sender<Result<ProofOutput, ProvingError>>,
    result: SharedResult<ProofOutput>,
    submitted: Instant,
    /// Tells apart successive jobs under the same id.
    generation: u64,
    waiters: usize,
}

/// Jobs this facade is waiting on, keyed by job id.
#[derive(Default)]
struct JobTable {
    jobs: DashMap<ProvingJobId, PendingJob>,
    next_generation: AtomicU64,
}

impl JobTable {
    /// Registers one more waiter for `id`. Returns the shared result, the job generation and
    /// whether the job is new and still has to be submitted.
    fn join(
        &self,
        id: &ProvingJobId,
        ty: ProvingRequestType,
    ) -> (SharedResult<ProofOutput>, u64, bool) {
        let joined = match self.jobs.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let job = entry.get_mut();
                job.waiters += 1;
                (job.result.clone(), job.generation, false)
            }
            Entry::Vacant(entry) => {
                let (resolve, receiver) = oneshot::channel();
                let result = receiver
                    .map(|outcome| outcome.unwrap_or(Err(ProvingError::Cancelled)))
                    .boxed()
                    .shared();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                entry.insert(PendingJob {
                    ty,
                    resolve,
                    result: result.clone(),
                    submitted: Instant::now(),
                    generation,
                    waiters: 1,
                });
                (result, generation, true)
            }
        };
        FACADE_METRICS.jobs_in_flight.set(self.jobs.len());
        joined
    }

    fn resolve(&self, id: &ProvingJobId, outcome: Result<ProofOutput, ProvingError>) {
        let Some((_, job)) = self.jobs.remove(id) else {
            return;
        };
        FACADE_METRICS.jobs_in_flight.set(self.jobs.len());
        FACADE_METRICS.job_latency[&job.ty.as_str()].observe(job.submitted.elapsed());
        match &outcome {
            Ok(_) => tracing::debug!(job_id = %id, "proving job resolved"),
            Err(err) => tracing::debug!(job_id = %id, %err, "proving job rejected"),
        }
        // Every waiter holds a clone of the shared result.
        let _ = job.resolve.send(outcome);
    }

    /// Drops one waiter of the given job generation. Returns `true` if it was the last one of a
    /// job that is still pending; the job is forgotten then.
    fn leave(&self, id: &ProvingJobId, generation: u64) -> bool {
        let Entry::Occupied(mut entry) = self.jobs.entry(id.clone()) else {
            return false;
        };
        let job = entry.get_mut();
        if job.generation != generation {
            return false;
        }
        job.waiters -= 1;
        if job.waiters > 0 {
            return false;
        }
        entry.remove();
        FACADE_METRICS.jobs_in_flight.set(self.jobs.len());
        true
    }
}

/// Cancels a job nobody waits for any more and drops it from the broker.
async fn cancel_at_broker(broker: &dyn ProvingJobProducer, id: &ProvingJobId) {
    tracing::info!(job_id = %id, "cancelling proving job");
    match broker.cancel_proving_job(id).await {
        Ok(()) | Err(BrokerError::JobAlreadyCancelled(_) | BrokerError::JobNotFound(_)) => {}
        Err(err) => tracing::warn!(job_id = %id, %err, "failed to cancel proving job"),
    }
    if let Err(err) = broker.clean_up_job(id).await {
        tracing::warn!(job_id = %id, %err, "failed to clean up proving job");
    }
}

/// One caller's interest in a pending job.
///
/// The last waiter to go away before the job settles cancels it at the broker, including when
/// the waiting future is dropped rather than polled to completion.
struct Waiter {
    table: Arc<JobTable>,
    broker: Arc<dyn ProvingJobProducer>,
    id: ProvingJobId,
    generation: u64,
    left: bool,
}

impl Waiter {
    fn leave(&mut self) -> bool {
        !std::mem::replace(&mut self.left, true) && self.table.leave(&self.id, self.generation)
    }

    async fn abandon(mut self) {
        if self.leave() {
            cancel_at_broker(self.broker.as_ref(), &self.id).await;
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.leave() {
            return;
        }
        let (broker, id) = (self.broker.clone(), self.id.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { cancel_at_broker(broker.as_ref(), &id).await });
            }
            Err(_) => {
                tracing::warn!(job_id = %self.id, "no runtime left to cancel abandoned proving job")
            }
        }
    }
}

/// [`Prover`] that hands every request to a proving broker and waits for an agent to prove it.
///
/// Identical requests map to the same job id and share one job and one result. A monitor task
/// started with [`Self::start`] polls the broker for settled jobs, loads their results from the
/// proof store and wakes the waiting callers.
pub struct BrokerProverFacade {
    broker: Arc<dyn ProvingJobProducer>,
    proof_store: Arc<dyn ProofStore>,
    config: FacadeConfig,
    jobs: Arc<JobTable>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for BrokerProverFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerProverFacade")
            .field("config", &self.config)
            .field("jobs_in_flight", &self.jobs_in_flight())
            .finish_non_exhaustive()
    }
}

impl BrokerProverFacade {
    pub fn new(
        broker: Arc<dyn ProvingJobProducer>,
        proof_store: Arc<dyn ProofStore>,
        config: FacadeConfig,
    ) -> Self {
        Self {
            broker,
            proof_store,
            config,
            jobs: Arc::default(),
            monitor: Mutex::new(None),
        }
    }

    /// Spawns the monitor task. Calling it again while the monitor runs is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(self.clone().monitor_jobs(stop.clone()));
        *monitor = Some((stop, handle));
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            snapshot_sync_interval = ?self.config.snapshot_sync_interval,
            "started broker prover facade"
        );
    }

    /// Stops the monitor and rejects every request still waiting for a proof.
    pub async fn stop(&self) {
        let monitor = self.monitor.lock().unwrap().take();
        if let Some((stop, handle)) = monitor {
            stop.cancel();
            if let Err(err) = handle.await {
                tracing::error!(%err, "broker prover facade monitor panicked");
            }
        }

        let ids: Vec<_> = self.jobs.jobs.iter().map(|entry| entry.key().clone()).collect();
        for id in &ids {
            self.jobs.resolve(id, Err(ProvingError::Cancelled));
        }
        tracing::info!(rejected = ids.len(), "stopped broker prover facade");
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.jobs.jobs.len()
    }

    async fn monitor_jobs(self: Arc<Self>, stop: CancellationToken) {
        let mut last_snapshot = Instant::now();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            // Normally only notifications are drained; now and then every outstanding id is
            // asked about as well.
            let ids: Vec<_> = if last_snapshot.elapsed() >= self.config.snapshot_sync_interval {
                last_snapshot = Instant::now();
                self.jobs.jobs.iter().map(|entry| entry.key().clone()).collect()
            } else {
                Vec::new()
            };
            let settled = match self.broker.get_completed_jobs(&ids).await {
                Ok(settled) => settled,
                Err(err) => {
                    tracing::warn!(%err, "failed to poll broker for completed jobs");
                    continue;
                }
            };
            for id in settled {
                // Other producers' jobs show up in the notifications as well.
                if !self.jobs.jobs.contains_key(&id) {
                    continue;
                }
                match self.broker.get_proving_job_status(&id).await {
                    Ok(status) => self.settle(&id, status).await,
                    Err(err) => {
                        tracing::warn!(job_id = %id, %err, "failed to fetch proving job status")
                    }
                }
            }
        }
    }

    /// Resolves the waiters of a settled job and forgets it at the broker.
    async fn settle(&self, id: &ProvingJobId, status: JobStatus) {
        let outcome = match status {
            JobStatus::Queued | JobStatus::InProgress { .. } => return,
            JobStatus::Completed { result_ref } => self
                .proof_store
                .get_proof_output(&result_ref)
                .await
                .map_err(ProvingError::from),
            JobStatus::Failed {
                reason,
                retryable: true,
            } => Err(ProvingError::MaxRetriesExceeded {
                id: id.clone(),
                reason,
            }),
            JobStatus::Failed {
                reason,
                retryable: false,
            } => Err(ProvingError::Fatal(reason)),
            JobStatus::Cancelled => Err(ProvingError::Cancelled),
        };
        if let Err(err) = self.broker.clean_up_job(id).await {
            tracing::warn!(job_id = %id, %err, "failed to clean up proving job");
        }
        self.jobs.resolve(id, outcome);
    }

    async fn submit(
        &self,
        id: &ProvingJobId,
        request: &ProvingRequest,
        ctx: &ProvingContext,
    ) -> Result<(), ProvingError> {
        let ty = request.request_type();
        let inputs = self.proof_store.save_proof_input(id, request).await?;
        let job = ProvingJob {
            id: id.clone(),
            ty,
            inputs,
            epoch_number: ctx.epoch_number,
            created_at: SystemClock.now_millis(),
        };
        let status = self.broker.enqueue_proving_job(job).await?;
        FACADE_METRICS.jobs_enqueued[&ty.as_str()].inc();
        tracing::debug!(job_id = %id, job_type = ty.as_str(), status = status.label(), "enqueued proving job");
        // A job the broker has seen before may already be done.
        if status.is_terminal() {
            self.settle(id, status).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Prover for BrokerProverFacade {
    async fn prove(
        &self,
        request: ProvingRequest,
        ctx: ProvingContext,
    ) -> Result<ProofOutput, ProvingError> {
        let ty = request.request_type();
        let id = ProvingJobId::new(ctx.epoch_number, ty, &request.to_bytes()?);
        let (result, generation, fresh) = self.jobs.join(&id, ty);
        let waiter = Waiter {
            table: self.jobs.clone(),
            broker: self.broker.clone(),
            id: id.clone(),
            generation,
            left: false,
        };

        if fresh {
            if let Err(err) = self.submit(&id, &request, &ctx).await {
                tracing::warn!(job_id = %id, %err, "failed to submit proving job");
                self.jobs.resolve(&id, Err(err));
            }
        } else {
            FACADE_METRICS.jobs_shared.inc();
            tracing::debug!(job_id = %id, "joining proving job already in flight");
        }

        tokio::select! {
            outcome = result => outcome,
            _ = ctx.cancel.cancelled() => {
                waiter.abandon().await;
                Err(ProvingError::Cancelled)
            }
        }
    }
}
