use crate::{ProofStore, ProofStoreError, decode, encode};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use epoch_prover_types::{
    ProofOutput, ProofUri, ProvingJobId, ProvingRequest, ProvingRequestType,
};

const PREFIX: &str = "data:application/octet-stream;base64,";

/// Keeps payloads inside the URI itself, so nothing has to be shared besides the broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineProofStore;

impl InlineProofStore {
    fn to_uri(bytes: &[u8]) -> ProofUri {
        ProofUri::new(format!("{PREFIX}{}", STANDARD.encode(bytes)))
    }

    fn from_uri(uri: &ProofUri) -> Result<Vec<u8>, ProofStoreError> {
        let encoded = uri
            .as_str()
            .strip_prefix(PREFIX)
            .ok_or_else(|| ProofStoreError::UnsupportedUri(uri.to_string()))?;
        STANDARD
            .decode(encoded)
            .map_err(|err| ProofStoreError::Decode(err.to_string()))
    }

    pub(crate) fn is_inline(uri: &ProofUri) -> bool {
        uri.as_str().starts_with(PREFIX)
    }
}

#[async_trait]
impl ProofStore for InlineProofStore {
    async fn save_proof_input(
        &self,
        _id: &ProvingJobId,
        request: &ProvingRequest,
    ) -> Result<ProofUri, ProofStoreError> {
        Ok(Self::to_uri(&encode(request)?))
    }

    async fn get_proof_input(&self, uri: &ProofUri) -> Result<ProvingRequest, ProofStoreError> {
        decode(&Self::from_uri(uri)?)
    }

    async fn save_proof_output(
        &self,
        _id: &ProvingJobId,
        _ty: ProvingRequestType,
        output: &ProofOutput,
    ) -> Result<ProofUri, ProofStoreError> {
        Ok(Self::to_uri(&encode(output)?))
    }

    async fn get_proof_output(&self, uri: &ProofUri) -> Result<ProofOutput, ProofStoreError> {
        decode(&Self::from_uri(uri)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use epoch_prover_types::{OpaqueInputs, Proof, PublicInputs, VerificationKey};

    #[tokio::test]
    async fn payloads_are_embedded_in_the_uri() {
        let store = InlineProofStore;
        let request = ProvingRequest::Tube(OpaqueInputs(vec![1, 2, 3]));
        let id = ProvingJobId::new(1, ProvingRequestType::Tube, &request.to_bytes().unwrap());

        let uri = store.save_proof_input(&id, &request).await.unwrap();
        assert!(uri.as_str().starts_with("data:application/octet-stream;base64,"));
        assert_eq!(store.get_proof_input(&uri).await.unwrap(), request);

        let output = ProofOutput {
            public_inputs: PublicInputs(vec![9]),
            proof: Proof(vec![8; 32]),
            verification_key: VerificationKey(vec![7]),
        };
        let uri = store
            .save_proof_output(&id, ProvingRequestType::Tube, &output)
            .await
            .unwrap();
        assert_eq!(store.get_proof_output(&uri).await.unwrap(), output);
    }

    #[tokio::test]
    async fn foreign_and_garbled_uris_are_rejected() {
        let store = InlineProofStore;
        assert_matches!(
            store.get_proof_output(&ProofUri::new("file:///tmp/x")).await,
            Err(ProofStoreError::UnsupportedUri(_))
        );
        assert_matches!(
            store
                .get_proof_output(&ProofUri::new(format!("{PREFIX}!!!")))
                .await,
            Err(ProofStoreError::Decode(_))
        );
    }
}
