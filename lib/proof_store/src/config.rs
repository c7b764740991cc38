use crate::{FileProofStore, InlineProofStore, ProofStore, ProofStoreError};
use smart_config::{DescribeConfig, DeserializeConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct ProofStoreConfig {
    /// Directory for proof payloads. When unset, payloads are inlined into `data:` URIs.
    pub directory: Option<PathBuf>,
}

impl ProofStoreConfig {
    pub async fn build(&self) -> Result<Arc<dyn ProofStore>, ProofStoreError> {
        Ok(match &self.directory {
            Some(dir) => {
                tracing::info!(directory = %dir.display(), "using file proof store");
                Arc::new(FileProofStore::new(dir).await?)
            }
            None => Arc::new(InlineProofStore),
        })
    }
}
