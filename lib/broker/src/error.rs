use epoch_prover_types::{ProvingError, ProvingJobId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("proving job {0} not found")]
    JobNotFound(ProvingJobId),
    #[error("proving job {0} was already cancelled")]
    JobAlreadyCancelled(ProvingJobId),
    #[error("proving job {0} already exists with different inputs")]
    DuplicateJobId(ProvingJobId),
    #[error("job database error: {0}")]
    Database(String),
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("malformed broker message: {0}")]
    Serialization(String),
}

impl BrokerError {
    pub(crate) fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rocksdb::Error> for BrokerError {
    fn from(err: rocksdb::Error) -> Self {
        Self::database(err)
    }
}

impl From<BrokerError> for ProvingError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::JobNotFound(id) => ProvingError::JobNotFound(id),
            BrokerError::JobAlreadyCancelled(id) => ProvingError::JobAlreadyCancelled(id),
            BrokerError::Database(_) | BrokerError::Transport(_) => ProvingError::transient(err),
            BrokerError::DuplicateJobId(_) | BrokerError::Serialization(_) => {
                ProvingError::fatal(err)
            }
        }
    }
}
