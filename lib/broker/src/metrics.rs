use std::time::Duration;
use vise::{Buckets, Counter, Gauge, Histogram, LabeledFamily, Metrics, Unit};

const LATENCIES_FAST: Buckets = Buckets::exponential(0.00001..=1.0, 2.0);

#[derive(Debug, Metrics)]
#[metrics(prefix = "proving_broker")]
pub struct BrokerMetrics {
    /// New jobs accepted, by circuit type.
    #[metrics(labels = ["job_type"])]
    pub jobs_enqueued: LabeledFamily<&'static str, Counter>,
    #[metrics(labels = ["job_type"])]
    pub jobs_completed: LabeledFamily<&'static str, Counter>,
    /// Jobs that ended in a terminal failure.
    #[metrics(labels = ["job_type"])]
    pub jobs_failed: LabeledFamily<&'static str, Counter>,
    /// Retryable failures that put a job back in the queue.
    #[metrics(labels = ["job_type"])]
    pub jobs_retried: LabeledFamily<&'static str, Counter>,
    #[metrics(labels = ["job_type"])]
    pub jobs_timed_out: LabeledFamily<&'static str, Counter>,
    #[metrics(labels = ["job_type"])]
    pub jobs_cancelled: LabeledFamily<&'static str, Counter>,
    /// Jobs waiting for an agent.
    pub queue_depth: Gauge<usize>,
    pub jobs_in_progress: Gauge<usize>,
    /// Time between enqueueing a job and handing it to an agent.
    #[metrics(labels = ["job_type"], buckets = Buckets::LATENCIES, unit = Unit::Seconds)]
    pub job_wait_time: LabeledFamily<&'static str, Histogram<Duration>>,
    /// Time between handing a job to an agent and receiving its result.
    #[metrics(labels = ["job_type"], buckets = Buckets::LATENCIES, unit = Unit::Seconds)]
    pub job_duration: LabeledFamily<&'static str, Histogram<Duration>>,
}

#[derive(Debug, Metrics)]
#[metrics(prefix = "proving_job_database")]
pub struct DatabaseMetrics {
    #[metrics(unit = Unit::Seconds, buckets = LATENCIES_FAST)]
    pub write_latency: Histogram<Duration>,
}

#[vise::register]
pub(crate) static BROKER_METRICS: vise::Global<BrokerMetrics> = vise::Global::new();
#[vise::register]
pub(crate) static DATABASE_METRICS: vise::Global<DatabaseMetrics> = vise::Global::new();
