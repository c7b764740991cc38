use crate::inline::InlineProofStore;
use crate::{ProofStore, ProofStoreError, decode, encode};
use async_trait::async_trait;
use epoch_prover_types::{
    ProofOutput, ProofUri, ProvingJobId, ProvingRequest, ProvingRequestType,
};
use std::path::{Path, PathBuf};
use url::Url;

/// Keeps payloads as files under a directory shared by producers and agents.
///
/// Inline `data:` URIs are still readable, so a producer may switch stores without stranding
/// jobs already in the broker.
#[derive(Debug, Clone)]
pub struct FileProofStore {
    root: PathBuf,
}

impl FileProofStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ProofStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ProvingJobId, name: &str) -> PathBuf {
        let dir: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
            .collect();
        self.root.join(dir).join(name)
    }

    async fn write(&self, path: PathBuf, bytes: Vec<u8>) -> Result<ProofUri, ProofStoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers must never observe a half-written payload.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(path = %path.display(), size = bytes.len(), "stored proof payload");

        let url = Url::from_file_path(&path)
            .map_err(|()| ProofStoreError::UnsupportedUri(path.display().to_string()))?;
        Ok(ProofUri::new(url.to_string()))
    }

    async fn read(&self, uri: &ProofUri) -> Result<Vec<u8>, ProofStoreError> {
        let path = Url::parse(uri.as_str())
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| ProofStoreError::UnsupportedUri(uri.to_string()))?;
        Ok(tokio::fs::read(path).await?)
    }
}

#[async_trait]
impl ProofStore for FileProofStore {
    async fn save_proof_input(
        &self,
        id: &ProvingJobId,
        request: &ProvingRequest,
    ) -> Result<ProofUri, ProofStoreError> {
        self.write(self.path_for(id, "input.bin"), encode(request)?)
            .await
    }

    async fn get_proof_input(&self, uri: &ProofUri) -> Result<ProvingRequest, ProofStoreError> {
        if InlineProofStore::is_inline(uri) {
            return InlineProofStore.get_proof_input(uri).await;
        }
        decode(&self.read(uri).await?)
    }

    async fn save_proof_output(
        &self,
        id: &ProvingJobId,
        ty: ProvingRequestType,
        output: &ProofOutput,
    ) -> Result<ProofUri, ProofStoreError> {
        self.write(self.path_for(id, &format!("{ty}.output.bin")), encode(output)?)
            .await
    }

    async fn get_proof_output(&self, uri: &ProofUri) -> Result<ProofOutput, ProofStoreError> {
        if InlineProofStore::is_inline(uri) {
            return InlineProofStore.get_proof_output(uri).await;
        }
        decode(&self.read(uri).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use epoch_prover_types::{OpaqueInputs, Proof, PublicInputs, VerificationKey};

    fn output() -> ProofOutput {
        ProofOutput {
            public_inputs: PublicInputs(vec![1, 1]),
            proof: Proof(vec![2; 64]),
            verification_key: VerificationKey(vec![3]),
        }
    }

    #[tokio::test]
    async fn payloads_live_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProofStore::new(dir.path().join("proofs")).await.unwrap();
        let request = ProvingRequest::BaseParity(OpaqueInputs(vec![5; 10]));
        let id = ProvingJobId::new(4, ProvingRequestType::BaseParity, &[5; 10]);

        let uri = store.save_proof_input(&id, &request).await.unwrap();
        assert!(uri.as_str().starts_with("file://"));
        assert_eq!(store.get_proof_input(&uri).await.unwrap(), request);

        let uri = store
            .save_proof_output(&id, ProvingRequestType::BaseParity, &output())
            .await
            .unwrap();
        assert!(uri.as_str().ends_with("base_parity.output.bin"));
        assert_eq!(store.get_proof_output(&uri).await.unwrap(), output());
    }

    #[tokio::test]
    async fn inline_uris_are_still_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProofStore::new(dir.path()).await.unwrap();
        let id = ProvingJobId::from("1:tube:00");
        let uri = InlineProofStore
            .save_proof_output(&id, ProvingRequestType::Tube, &output())
            .await
            .unwrap();
        assert_eq!(store.get_proof_output(&uri).await.unwrap(), output());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProofStore::new(dir.path()).await.unwrap();
        let uri = ProofUri::new(
            Url::from_file_path(store.root().join("nope.bin"))
                .unwrap()
                .to_string(),
        );
        assert_matches!(store.get_proof_output(&uri).await, Err(ProofStoreError::Io(_)));
        assert_matches!(
            store.get_proof_output(&ProofUri::new("s3://bucket/key")).await,
            Err(ProofStoreError::UnsupportedUri(_))
        );
    }
}
