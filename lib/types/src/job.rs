use crate::clock::UnixMillis;
use crate::request_type::ProvingRequestType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type EpochNumber = u64;

/// Identity of a proving job.
///
/// Ids are derived from the request content (`{epoch}:{type}:{sha256(inputs)}`), so submitting
/// the same request twice always lands on the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvingJobId(String);

impl ProvingJobId {
    pub fn new(epoch: EpochNumber, ty: ProvingRequestType, inputs: &[u8]) -> Self {
        let inputs_hash = Sha256::digest(inputs);
        Self(format!("{epoch}:{ty}:{}", hex::encode(inputs_hash)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProvingJobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ProvingJobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ProvingJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a payload held by a proof store (`data:` or `file://` URI).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofUri(String);

impl ProofUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Inline URIs carry whole proofs; only print the head.
impl fmt::Debug for ProofUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_LEN: usize = 64;
        match self.0.char_indices().nth(MAX_LEN) {
            Some((cut, _)) => write!(f, "ProofUri({}...)", &self.0[..cut]),
            None => write!(f, "ProofUri({})", self.0),
        }
    }
}

impl fmt::Display for ProofUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of proving work. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingJob {
    pub id: ProvingJobId,
    #[serde(rename = "type")]
    pub ty: ProvingRequestType,
    pub inputs: ProofUri,
    pub epoch_number: EpochNumber,
    pub created_at: UnixMillis,
}

impl ProvingJob {
    /// Whether `other` describes the same work. `created_at` is ignored: a re-submission
    /// of the same request after a producer restart carries a fresh timestamp.
    pub fn same_work_as(&self, other: &ProvingJob) -> bool {
        self.id == other.id
            && self.ty == other.ty
            && self.inputs == other.inputs
            && self.epoch_number == other.epoch_number
    }
}

/// Lifecycle of a job inside the broker.
///
/// Only `Queued <-> InProgress` may cycle; `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress {
        agent_id: AgentId,
        started_at: UnixMillis,
        deadline: UnixMillis,
    },
    Completed {
        result_ref: ProofUri,
    },
    /// `retryable` is set when a transient failure ran out of retries.
    Failed {
        reason: String,
        retryable: bool,
    },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    /// Completed or failed; the producer has an outcome to pick up.
    pub fn is_settled(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress { .. } => "in_progress",
            JobStatus::Completed { .. } => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Who is asking for work and which circuits it can run. An empty allow list accepts any type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingJobFilter {
    pub agent_id: AgentId,
    #[serde(default)]
    pub allow_list: Vec<ProvingRequestType>,
}

impl ProvingJobFilter {
    pub fn any(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            allow_list: Vec::new(),
        }
    }

    pub fn only(agent_id: AgentId, allow_list: impl IntoIterator<Item = ProvingRequestType>) -> Self {
        Self {
            agent_id,
            allow_list: allow_list.into_iter().collect(),
        }
    }

    pub fn accepts(&self, ty: ProvingRequestType) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(&ty)
    }
}

/// A job handed to an agent. `started_at` identifies this particular assignment and is echoed
/// back in heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLease {
    pub job: ProvingJob,
    pub started_at: UnixMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_content_addressed() {
        let a = ProvingJobId::new(1, ProvingRequestType::MergeRollup, b"inputs");
        let b = ProvingJobId::new(1, ProvingRequestType::MergeRollup, b"inputs");
        let c = ProvingJobId::new(2, ProvingRequestType::MergeRollup, b"inputs");
        let d = ProvingJobId::new(1, ProvingRequestType::MergeRollup, b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.as_str().starts_with("1:merge_rollup:"));
    }

    #[test]
    fn status_serializes_with_tag() {
        let status = JobStatus::InProgress {
            agent_id: AgentId::new("agent-1"),
            started_at: 10,
            deadline: 20,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["agent_id"], "agent-1");
        let back: JobStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn filter_with_empty_allow_list_accepts_everything() {
        let filter = ProvingJobFilter::any(AgentId::new("a"));
        assert!(ProvingRequestType::ALL.iter().all(|ty| filter.accepts(*ty)));

        let filter = ProvingJobFilter::only(AgentId::new("a"), [ProvingRequestType::Tube]);
        assert!(filter.accepts(ProvingRequestType::Tube));
        assert!(!filter.accepts(ProvingRequestType::Avm));
    }

    #[test]
    fn long_uris_are_truncated_in_debug_output() {
        let uri = ProofUri::new("x".repeat(1000));
        let printed = format!("{uri:?}");
        assert!(printed.len() < 100);
        assert!(printed.ends_with("...)"));
    }
}
