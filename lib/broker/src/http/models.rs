use crate::BrokerError;
use epoch_prover_types::{ProofUri, ProvingJobFilter, ProvingJobId, UnixMillis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct CompletedJobsPayload {
    pub ids: Vec<ProvingJobId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ProgressPayload {
    pub started_at: UnixMillis,
    pub filter: ProvingJobFilter,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SuccessPayload {
    pub result_ref: ProofUri,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ErrorPayload {
    pub reason: String,
    pub retryable: bool,
    #[serde(default)]
    pub filter: Option<ProvingJobFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(super) enum ErrorCode {
    JobNotFound,
    JobAlreadyCancelled,
    DuplicateJobId,
    Database,
    Internal,
}

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub job_id: Option<ProvingJobId>,
}

impl From<&BrokerError> for ErrorResponse {
    fn from(err: &BrokerError) -> Self {
        let (code, job_id) = match err {
            BrokerError::JobNotFound(id) => (ErrorCode::JobNotFound, Some(id.clone())),
            BrokerError::JobAlreadyCancelled(id) => {
                (ErrorCode::JobAlreadyCancelled, Some(id.clone()))
            }
            BrokerError::DuplicateJobId(id) => (ErrorCode::DuplicateJobId, Some(id.clone())),
            BrokerError::Database(_) => (ErrorCode::Database, None),
            BrokerError::Transport(_) | BrokerError::Serialization(_) => {
                (ErrorCode::Internal, None)
            }
        };
        Self {
            code,
            message: err.to_string(),
            job_id,
        }
    }
}

impl ErrorResponse {
    pub fn into_broker_error(self, fallback_id: Option<&ProvingJobId>) -> BrokerError {
        let id = self.job_id.or_else(|| fallback_id.cloned());
        match (self.code, id) {
            (ErrorCode::JobNotFound, Some(id)) => BrokerError::JobNotFound(id),
            (ErrorCode::JobAlreadyCancelled, Some(id)) => BrokerError::JobAlreadyCancelled(id),
            (ErrorCode::DuplicateJobId, Some(id)) => BrokerError::DuplicateJobId(id),
            (ErrorCode::Database, _) => BrokerError::Database(self.message),
            _ => BrokerError::Transport(self.message),
        }
    }
}
