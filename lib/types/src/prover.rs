use crate::error::ProvingError;
use crate::job::EpochNumber;
use crate::proof::{ProofOutput, ProvingRequest, PublicInputs, SimulationRequest};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Per-request context handed to a [`Prover`].
#[derive(Debug, Clone)]
pub struct ProvingContext {
    pub epoch_number: EpochNumber,
    /// Fires when the requester is no longer interested in the proof.
    pub cancel: CancellationToken,
}

impl ProvingContext {
    pub fn new(epoch_number: EpochNumber) -> Self {
        Self {
            epoch_number,
            cancel: CancellationToken::new(),
        }
    }

    /// Context whose cancellation follows `parent` but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            epoch_number: self.epoch_number,
            cancel: self.cancel.child_token(),
        }
    }
}

/// Produces a recursive proof for a circuit.
///
/// Implemented by concrete proving backends (run by agents) and by the broker-backed facade
/// that the orchestrator talks to.
#[async_trait]
pub trait Prover: Send + Sync + 'static {
    async fn prove(
        &self,
        request: ProvingRequest,
        ctx: ProvingContext,
    ) -> Result<ProofOutput, ProvingError>;
}

/// Computes a circuit's public inputs without proving it.
#[async_trait]
pub trait Simulator: Send + Sync + 'static {
    async fn simulate(&self, request: SimulationRequest) -> Result<PublicInputs, ProvingError>;

    /// Public inputs of a leaf circuit, used for padding.
    async fn simulate_leaf(&self, request: &ProvingRequest) -> Result<PublicInputs, ProvingError>;
}

#[async_trait]
impl<T: Prover + ?Sized> Prover for std::sync::Arc<T> {
    async fn prove(
        &self,
        request: ProvingRequest,
        ctx: ProvingContext,
    ) -> Result<ProofOutput, ProvingError> {
        (**self).prove(request, ctx).await
    }
}

#[async_trait]
impl<T: Simulator + ?Sized> Simulator for std::sync::Arc<T> {
    async fn simulate(&self, request: SimulationRequest) -> Result<PublicInputs, ProvingError> {
        (**self).simulate(request).await
    }

    async fn simulate_leaf(&self, request: &ProvingRequest) -> Result<PublicInputs, ProvingError> {
        (**self).simulate_leaf(request).await
    }
}
