use std::time::Duration;
use vise::{Buckets, Counter, Histogram, LabeledFamily, Metrics, Unit};

const PROVING_DURATION: Buckets = Buckets::exponential(0.1..=3_600.0, 2.0);

#[derive(Debug, Metrics)]
#[metrics(prefix = "proving_agent")]
pub struct AgentMetrics {
    #[metrics(labels = ["job_type"])]
    pub jobs_started: LabeledFamily<&'static str, Counter>,
    #[metrics(labels = ["job_type"])]
    pub jobs_succeeded: LabeledFamily<&'static str, Counter>,
    #[metrics(labels = ["job_type"])]
    pub jobs_failed: LabeledFamily<&'static str, Counter>,
    /// Jobs given up because the broker handed the slot another one.
    pub jobs_abandoned: Counter,
    /// Polls that found no work.
    pub idle_polls: Counter,
    #[metrics(labels = ["job_type"], buckets = PROVING_DURATION, unit = Unit::Seconds)]
    pub proving_duration: LabeledFamily<&'static str, Histogram<Duration>>,
}

#[vise::register]
pub(crate) static AGENT_METRICS: vise::Global<AgentMetrics> = vise::Global::new();
