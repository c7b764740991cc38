use crate::job::ProvingJobId;

/// Errors observed by proving producers (tree nodes, the broker facade).
///
/// Cloneable because a single failure fans out to every waiter of a memoized computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvingError {
    /// Retryable: resource exhaustion, transient I/O.
    #[error("transient job error: {0}")]
    Transient(String),
    /// Not retryable: malformed inputs, simulation/proof mismatch, internal assertion failure.
    #[error("fatal job error: {0}")]
    Fatal(String),
    #[error("job {id} failed after exhausting its retries: {reason}")]
    MaxRetriesExceeded { id: ProvingJobId, reason: String },
    #[error("proving job {0} not found")]
    JobNotFound(ProvingJobId),
    #[error("invalid child index {index}: {reason}")]
    InvalidChildIndex { index: usize, reason: &'static str },
    #[error("proving job {0} was already cancelled")]
    JobAlreadyCancelled(ProvingJobId),
    #[error("proving was cancelled")]
    Cancelled,
}

impl ProvingError {
    pub fn fatal(reason: impl std::fmt::Display) -> Self {
        Self::Fatal(reason.to_string())
    }

    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient(reason.to_string())
    }

    /// Whether a broker may retry the job that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failures of a concrete proving backend, as classified by the agent that runs it.
#[derive(Debug, thiserror::Error)]
pub enum ProverError {
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed circuit inputs: {0}")]
    MalformedInput(String),
    #[error("internal assertion failed: {0}")]
    Internal(String),
}

impl ProverError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProverError::ResourceExhausted(_) | ProverError::Io(_) => true,
            ProverError::MalformedInput(_) | ProverError::Internal(_) => false,
        }
    }
}

impl From<ProverError> for ProvingError {
    fn from(err: ProverError) -> Self {
        if err.is_retryable() {
            ProvingError::Transient(err.to_string())
        } else {
            ProvingError::Fatal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn prover_errors_are_classified() {
        let oom: ProvingError = ProverError::ResourceExhausted("out of GPU memory".into()).into();
        assert_matches!(oom, ProvingError::Transient(_));
        assert!(oom.is_retryable());

        let io: ProvingError =
            ProverError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "srs fetch")).into();
        assert!(io.is_retryable());

        let malformed: ProvingError = ProverError::MalformedInput("bad witness".into()).into();
        assert_matches!(malformed, ProvingError::Fatal(_));
        assert!(!malformed.is_retryable());

        assert!(!ProvingError::Cancelled.is_retryable());
    }
}
