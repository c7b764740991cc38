use crate::config::BrokerConfig;
use crate::database::ProvingJobDatabase;
use crate::metrics::BROKER_METRICS;
use crate::queue::{JobQueue, QueueKey};
use crate::traits::{ProvingJobConsumer, ProvingJobProducer};
use crate::BrokerError;
use async_trait::async_trait;
use epoch_prover_types::{
    AgentId, Clock, JobLease, JobStatus, ProofUri, ProvingJob, ProvingJobFilter, ProvingJobId,
    SystemClock, UnixMillis,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct JobRecord {
    job: ProvingJob,
    status: JobStatus,
    retries: u32,
    queue_key: Option<QueueKey>,
    queued_at: UnixMillis,
}

#[derive(Debug, Default)]
struct BrokerState {
    jobs: HashMap<ProvingJobId, JobRecord>,
    queue: JobQueue,
    /// Jobs settled since the last `get_completed_jobs` call.
    settled_since_poll: Vec<ProvingJobId>,
    in_progress: usize,
}

impl BrokerState {
    fn enqueue(&mut self, id: &ProvingJobId, now: UnixMillis) {
        let Some(record) = self.jobs.get_mut(id) else {
            return;
        };
        let key = self
            .queue
            .push(record.job.ty, record.job.epoch_number, id.clone());
        record.queue_key = Some(key);
        record.queued_at = now;
        self.set_status(id, JobStatus::Queued);
        BROKER_METRICS.queue_depth.set(self.queue.len());
    }

    fn dequeue(&mut self, id: &ProvingJobId) {
        let Some(record) = self.jobs.get_mut(id) else {
            return;
        };
        if let Some(key) = record.queue_key.take() {
            self.queue.remove(record.job.ty, key);
            BROKER_METRICS.queue_depth.set(self.queue.len());
        }
    }

    fn settle(&mut self, id: &ProvingJobId, status: JobStatus) {
        self.dequeue(id);
        if self.jobs.contains_key(id) {
            self.set_status(id, status);
            self.settled_since_poll.push(id.clone());
        }
    }

    /// Replaces a job's status, keeping the in-progress gauge in step.
    fn set_status(&mut self, id: &ProvingJobId, status: JobStatus) {
        let Some(record) = self.jobs.get_mut(id) else {
            return;
        };
        let was_running = matches!(record.status, JobStatus::InProgress { .. });
        let is_running = matches!(status, JobStatus::InProgress { .. });
        record.status = status;
        match (was_running, is_running) {
            (false, true) => self.in_progress += 1,
            (true, false) => self.in_progress -= 1,
            _ => {}
        }
        BROKER_METRICS.jobs_in_progress.set(self.in_progress);
    }
}

/// Per-state job counts, served on the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Shared queue matching proving jobs to agents.
///
/// All state sits behind one mutex that is never held across an `.await`, so every transition
/// of a job is atomic with respect to every other one. Database writes happen under the same
/// lock, before the in-memory transition they record.
#[derive(Debug)]
pub struct ProvingBroker {
    config: BrokerConfig,
    database: Arc<dyn ProvingJobDatabase>,
    clock: Arc<dyn Clock>,
    state: Mutex<BrokerState>,
}

impl ProvingBroker {
    pub fn new(config: BrokerConfig, database: Arc<dyn ProvingJobDatabase>) -> Self {
        Self::with_clock(config, database, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: BrokerConfig,
        database: Arc<dyn ProvingJobDatabase>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            database,
            clock,
            state: Mutex::new(BrokerState::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn deadline(&self, now: UnixMillis) -> UnixMillis {
        now + self.config.job_timeout.as_millis() as UnixMillis
    }

    /// Rebuilds in-memory state from the database: settled and cancelled jobs keep their
    /// outcome, everything else goes back to the queue.
    pub fn start(&self) -> Result<(), BrokerError> {
        let mut rows = self.database.all_jobs()?;
        rows.sort_by(|a, b| {
            (a.job.epoch_number, a.job.created_at).cmp(&(b.job.epoch_number, b.job.created_at))
        });
        let now = self.clock.now_millis();
        let mut state = BrokerState::default();
        let (mut requeued, mut settled) = (0, 0);
        for row in rows {
            let id = row.job.id.clone();
            let outcome = row.outcome;
            state.jobs.insert(
                id.clone(),
                JobRecord {
                    job: row.job,
                    status: JobStatus::Queued,
                    retries: 0,
                    queue_key: None,
                    queued_at: now,
                },
            );
            match outcome {
                Some(outcome) => {
                    let status = JobStatus::from(outcome);
                    if status.is_settled() {
                        settled += 1;
                        state.settled_since_poll.push(id.clone());
                    }
                    if let Some(record) = state.jobs.get_mut(&id) {
                        record.status = status;
                    }
                }
                None => {
                    requeued += 1;
                    state.enqueue(&id, now);
                }
            }
        }
        BROKER_METRICS.queue_depth.set(state.queue.len());
        BROKER_METRICS.jobs_in_progress.set(state.in_progress);
        *self.state.lock().unwrap() = state;
        tracing::info!(requeued, settled, "proving broker restored job database");
        Ok(())
    }

    /// Requeues (or fails, once out of retries) every in-progress job past its deadline.
    pub fn check_timeouts(&self) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        let expired: Vec<ProvingJobId> = state
            .jobs
            .iter()
            .filter_map(|(id, record)| match &record.status {
                JobStatus::InProgress { deadline, .. } => (*deadline <= now).then(|| id.clone()),
                _ => None,
            })
            .collect();

        for id in expired {
            let Some(record) = state.jobs.get(&id) else {
                continue;
            };
            let job_type = record.job.ty;
            BROKER_METRICS.jobs_timed_out[&job_type.as_str()].inc();
            if let Err(err) =
                self.fail_attempt(&mut state, &id, "proving job timed out".to_owned(), true, now)
            {
                // Stays in progress; the next sweep tries again.
                tracing::error!(job_id = %id, %err, "failed to record job timeout");
                continue;
            }
            tracing::warn!(job_id = %id, %job_type, "proving job timed out");
        }
    }

    /// Runs the periodic timeout sweep until `stop` fires.
    pub async fn run_timeout_loop(self: Arc<Self>, stop: CancellationToken) -> anyhow::Result<()> {
        let mut timer = tokio::time::interval(self.config.timeout_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::info!("stopping proving broker timeout loop");
                    return Ok(());
                }
                _ = timer.tick() => self.check_timeouts(),
            }
        }
    }

    pub fn status_summary(&self) -> BrokerStatus {
        let state = self.state.lock().unwrap();
        let mut summary = BrokerStatus::default();
        for record in state.jobs.values() {
            match record.status {
                JobStatus::Queued => summary.queued += 1,
                JobStatus::InProgress { .. } => summary.in_progress += 1,
                JobStatus::Completed { .. } => summary.completed += 1,
                JobStatus::Failed { .. } => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Counts one failed attempt: requeues while retries remain, otherwise fails the job.
    fn fail_attempt(
        &self,
        state: &mut BrokerState,
        id: &ProvingJobId,
        reason: String,
        retryable: bool,
        now: UnixMillis,
    ) -> Result<(), BrokerError> {
        let Some(record) = state.jobs.get_mut(id) else {
            return Ok(());
        };
        let job_type = record.job.ty;
        if retryable && record.retries < self.config.max_retries {
            record.retries += 1;
            let retries = record.retries;
            state.dequeue(id);
            state.enqueue(id, now);
            BROKER_METRICS.jobs_retried[&job_type.as_str()].inc();
            tracing::info!(job_id = %id, %job_type, retries, %reason, "re-queued proving job");
            return Ok(());
        }

        self.database.set_job_error(id, &reason, retryable)?;
        tracing::warn!(job_id = %id, %job_type, retryable, %reason, "proving job failed");
        state.settle(id, JobStatus::Failed { reason, retryable });
        BROKER_METRICS.jobs_failed[&job_type.as_str()].inc();
        Ok(())
    }

    fn take_next_job(
        &self,
        state: &mut BrokerState,
        filter: &ProvingJobFilter,
    ) -> Option<JobLease> {
        let now = self.clock.now_millis();
        while let Some(id) = state.queue.pop(filter) {
            BROKER_METRICS.queue_depth.set(state.queue.len());
            let Some(record) = state.jobs.get_mut(&id) else {
                continue;
            };
            if !matches!(record.status, JobStatus::Queued) {
                tracing::warn!(job_id = %id, status = record.status.label(), "skipping stale queue entry");
                continue;
            }
            record.queue_key = None;
            let (job, queued_at) = (record.job.clone(), record.queued_at);
            state.set_status(
                &id,
                JobStatus::InProgress {
                    agent_id: filter.agent_id.clone(),
                    started_at: now,
                    deadline: self.deadline(now),
                },
            );
            BROKER_METRICS.job_wait_time[&job.ty.as_str()]
                .observe(Duration::from_millis(now.saturating_sub(queued_at)));
            tracing::debug!(
                job_id = %id,
                job_type = %job.ty,
                agent_id = %filter.agent_id,
                "assigned proving job"
            );
            return Some(JobLease {
                job,
                started_at: now,
            });
        }
        None
    }

    fn claim(
        state: &mut BrokerState,
        id: &ProvingJobId,
        agent_id: &AgentId,
        started_at: UnixMillis,
        deadline: UnixMillis,
    ) {
        state.set_status(
            id,
            JobStatus::InProgress {
                agent_id: agent_id.clone(),
                started_at,
                deadline,
            },
        );
    }

    /// Jobs the in-progress gauge currently accounts for.
    #[cfg(test)]
    pub(crate) fn tracked_in_progress(&self) -> usize {
        self.state.lock().unwrap().in_progress
    }
}

#[async_trait]
impl ProvingJobProducer for ProvingBroker {
    async fn enqueue_proving_job(&self, job: ProvingJob) -> Result<JobStatus, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.jobs.get(&job.id) {
            if !record.job.same_work_as(&job) {
                return Err(BrokerError::DuplicateJobId(job.id));
            }
            tracing::debug!(job_id = %job.id, status = record.status.label(), "proving job already known");
            return Ok(record.status.clone());
        }

        self.database.add_job(&job)?;
        let (id, job_type, epoch) = (job.id.clone(), job.ty, job.epoch_number);
        state.jobs.insert(
            id.clone(),
            JobRecord {
                job,
                status: JobStatus::Queued,
                retries: 0,
                queue_key: None,
                queued_at: 0,
            },
        );
        state.enqueue(&id, self.clock.now_millis());
        BROKER_METRICS.jobs_enqueued[&job_type.as_str()].inc();
        tracing::info!(job_id = %id, %job_type, epoch, "enqueued proving job");
        Ok(JobStatus::Queued)
    }

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> Result<JobStatus, BrokerError> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(id)
            .map(|record| record.status.clone())
            .ok_or_else(|| BrokerError::JobNotFound(id.clone()))
    }

    async fn cancel_proving_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .jobs
            .get(id)
            .ok_or_else(|| BrokerError::JobNotFound(id.clone()))?;
        match &record.status {
            JobStatus::Cancelled => Err(BrokerError::JobAlreadyCancelled(id.clone())),
            JobStatus::Completed { .. } | JobStatus::Failed { .. } => {
                tracing::debug!(job_id = %id, "not cancelling settled proving job");
                Ok(())
            }
            JobStatus::Queued | JobStatus::InProgress { .. } => {
                let job_type = record.job.ty;
                self.database.set_job_cancelled(id)?;
                state.dequeue(id);
                state.set_status(id, JobStatus::Cancelled);
                BROKER_METRICS.jobs_cancelled[&job_type.as_str()].inc();
                tracing::info!(job_id = %id, %job_type, "cancelled proving job");
                Ok(())
            }
        }
    }

    async fn get_completed_jobs(
        &self,
        ids: &[ProvingJobId],
    ) -> Result<Vec<ProvingJobId>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        let notifications = std::mem::take(&mut state.settled_since_poll);
        let mut seen = HashSet::new();
        let completed = ids
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(*id)
                    .is_some_and(|record| record.status.is_settled())
            })
            .cloned()
            .chain(notifications)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Ok(completed)
    }

    async fn clean_up_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.jobs.get(id) else {
            return Ok(());
        };
        if !record.status.is_terminal() {
            tracing::warn!(job_id = %id, status = record.status.label(), "refusing to clean up busy proving job");
            return Ok(());
        }
        self.database.delete_job(id)?;
        state.jobs.remove(id);
        state.settled_since_poll.retain(|settled| settled != id);
        tracing::debug!(job_id = %id, "cleaned up proving job");
        Ok(())
    }
}

#[async_trait]
impl ProvingJobConsumer for ProvingBroker {
    async fn get_proving_job(
        &self,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        Ok(self.take_next_job(&mut state, filter))
    }

    async fn report_proving_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: UnixMillis,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(now);
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(status) = state.jobs.get(id).map(|record| record.status.clone()) else {
            tracing::warn!(job_id = %id, agent_id = %filter.agent_id, "progress reported for unknown proving job");
            return Ok(self.take_next_job(state, filter));
        };

        match status {
            // Requeued after a timeout or a broker restart while the agent kept working.
            JobStatus::Queued => {
                state.dequeue(id);
                Self::claim(state, id, &filter.agent_id, started_at, deadline);
                tracing::info!(job_id = %id, agent_id = %filter.agent_id, "agent reclaimed queued proving job");
                Ok(None)
            }
            // The earliest assignment wins; it has made the most progress.
            JobStatus::InProgress {
                started_at: current,
                agent_id,
                ..
            } if started_at <= current => {
                if started_at < current {
                    tracing::info!(
                        job_id = %id,
                        agent_id = %filter.agent_id,
                        previous_agent = %agent_id,
                        "older assignment took over proving job"
                    );
                }
                Self::claim(state, id, &filter.agent_id, started_at, deadline);
                Ok(None)
            }
            JobStatus::InProgress { agent_id, .. } => {
                tracing::warn!(
                    job_id = %id,
                    agent_id = %filter.agent_id,
                    owner = %agent_id,
                    "proving job is owned by another agent, sending a new one"
                );
                Ok(self.take_next_job(state, filter))
            }
            finished @ (JobStatus::Completed { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled) => {
                tracing::debug!(job_id = %id, status = finished.label(), "progress reported for finished proving job");
                Ok(self.take_next_job(state, filter))
            }
        }
    }

    async fn report_proving_job_success(
        &self,
        id: &ProvingJobId,
        result_ref: ProofUri,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.jobs.get(id) else {
            tracing::warn!(job_id = %id, "result reported for unknown proving job, ignoring");
            return Ok(());
        };
        let job_type = record.job.ty;
        match record.status.clone() {
            JobStatus::Queued | JobStatus::InProgress { .. } => {
                if let JobStatus::InProgress { started_at, .. } = record.status {
                    BROKER_METRICS.job_duration[&job_type.as_str()]
                        .observe(Duration::from_millis(now.saturating_sub(started_at)));
                }
                self.database.set_job_result(id, &result_ref)?;
                state.settle(id, JobStatus::Completed { result_ref });
                BROKER_METRICS.jobs_completed[&job_type.as_str()].inc();
                tracing::info!(job_id = %id, %job_type, "proving job completed");
            }
            JobStatus::Cancelled => {
                tracing::info!(job_id = %id, "discarding result of cancelled proving job");
            }
            JobStatus::Completed { .. } | JobStatus::Failed { .. } => {
                tracing::debug!(job_id = %id, "proving job already settled, ignoring result");
            }
        }
        Ok(())
    }

    async fn report_proving_job_error(
        &self,
        id: &ProvingJobId,
        reason: String,
        retryable: bool,
        filter: Option<&ProvingJobFilter>,
    ) -> Result<Option<JobLease>, BrokerError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        let status = state.jobs.get(id).map(|record| record.status.clone());
        match status {
            None => {
                tracing::warn!(job_id = %id, %reason, "error reported for unknown proving job, ignoring");
            }
            Some(JobStatus::Queued | JobStatus::InProgress { .. }) => {
                self.fail_attempt(&mut state, id, reason, retryable, now)?;
            }
            Some(status) => {
                tracing::debug!(job_id = %id, status = status.label(), "proving job already finished, ignoring error");
            }
        }
        Ok(filter.and_then(|filter| self.take_next_job(&mut state, filter)))
    }
}
