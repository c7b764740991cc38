use std::time::Duration;
use vise::{Buckets, Counter, Gauge, Histogram, LabeledFamily, Metrics, Unit};

const PROVING_DURATION: Buckets = Buckets::exponential(0.1..=3_600.0, 2.0);

#[derive(Debug, Metrics)]
#[metrics(prefix = "proof_tree")]
pub struct TreeMetrics {
    #[metrics(labels = ["circuit"])]
    pub nodes_proven: LabeledFamily<&'static str, Counter>,
    #[metrics(labels = ["circuit"])]
    pub nodes_failed: LabeledFamily<&'static str, Counter>,
    /// Proofs whose public inputs differ from the simulated ones.
    pub consistency_mismatches: Counter,
    /// Time from both children being proven to the node being proven.
    #[metrics(labels = ["circuit"], buckets = PROVING_DURATION, unit = Unit::Seconds)]
    pub node_proving_duration: LabeledFamily<&'static str, Histogram<Duration>>,
}

#[derive(Debug, Metrics)]
#[metrics(prefix = "broker_prover_facade")]
pub struct FacadeMetrics {
    #[metrics(labels = ["job_type"])]
    pub jobs_enqueued: LabeledFamily<&'static str, Counter>,
    /// Requests that joined a job already in flight.
    pub jobs_shared: Counter,
    pub jobs_in_flight: Gauge<usize>,
    /// Time from enqueueing a job to receiving its outcome.
    #[metrics(labels = ["job_type"], buckets = PROVING_DURATION, unit = Unit::Seconds)]
    pub job_latency: LabeledFamily<&'static str, Histogram<Duration>>,
}

#[vise::register]
pub(crate) static TREE_METRICS: vise::Global<TreeMetrics> = vise::Global::new();
#[vise::register]
pub(crate) static FACADE_METRICS: vise::Global<FacadeMetrics> = vise::Global::new();
