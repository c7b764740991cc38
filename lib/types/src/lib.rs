//! Shared data model of the epoch prover.
//!
//! Everything that crosses a component boundary lives here: circuit kinds, proving jobs and
//! their status, proof payloads, the typed proving requests, the error taxonomy and the
//! `Prover` / `Simulator` capabilities.

mod clock;
pub use clock::{Clock, ManualClock, SystemClock, UnixMillis};

mod error;
pub use error::{ProverError, ProvingError};

mod job;
pub use job::{
    AgentId, EpochNumber, JobLease, JobStatus, ProofUri, ProvingJob, ProvingJobFilter,
    ProvingJobId,
};

mod proof;
pub use proof::{
    AggregationInputs, ChildProof, OpaqueInputs, Proof, ProofOutput, ProvingRequest,
    PublicInputs, SimulationRequest, VerificationKey,
};

mod prover;
pub use prover::{Prover, ProvingContext, Simulator};

mod request_type;
pub use request_type::{ProvingRequestType, UnknownRequestType};

pub mod vk_tree;
pub use vk_tree::{VkMembershipWitness, VkTree};
