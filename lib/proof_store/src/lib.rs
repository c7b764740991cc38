//! Storage for proving job payloads.
//!
//! Jobs travel through the broker by reference: producers save the typed request here and hand
//! the returned [`ProofUri`] to the broker; agents resolve it, prove, and save the output the same
//! way.

mod config;
mod file;
mod inline;

pub use config::ProofStoreConfig;
pub use file::FileProofStore;
pub use inline::InlineProofStore;

use async_trait::async_trait;
use epoch_prover_types::{
    ProofOutput, ProofUri, ProvingError, ProvingJobId, ProvingRequest, ProvingRequestType,
};
use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum ProofStoreError {
    #[error("URI `{0}` is not supported by this proof store")]
    UnsupportedUri(String),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("proof store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProofStoreError> for ProvingError {
    fn from(err: ProofStoreError) -> Self {
        match err {
            ProofStoreError::Io(_) => ProvingError::transient(err),
            ProofStoreError::UnsupportedUri(_)
            | ProofStoreError::Encode(_)
            | ProofStoreError::Decode(_) => ProvingError::fatal(err),
        }
    }
}

#[async_trait]
pub trait ProofStore: Send + Sync + 'static {
    async fn save_proof_input(
        &self,
        id: &ProvingJobId,
        request: &ProvingRequest,
    ) -> Result<ProofUri, ProofStoreError>;

    async fn get_proof_input(&self, uri: &ProofUri) -> Result<ProvingRequest, ProofStoreError>;

    async fn save_proof_output(
        &self,
        id: &ProvingJobId,
        ty: ProvingRequestType,
        output: &ProofOutput,
    ) -> Result<ProofUri, ProofStoreError>;

    async fn get_proof_output(&self, uri: &ProofUri) -> Result<ProofOutput, ProofStoreError>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProofStoreError> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProofStoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|err| ProofStoreError::Decode(err.to_string()))
}
