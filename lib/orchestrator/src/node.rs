use crate::config::OrchestratorConfig;
use crate::metrics::TREE_METRICS;
use crate::slot::{SharedResult, Slot};
use epoch_prover_types::vk_tree::VkTree;
use epoch_prover_types::{
    AggregationInputs, ChildProof, ProofOutput, Prover, ProvingContext, ProvingError,
    ProvingRequest, ProvingRequestType, PublicInputs, SimulationRequest, Simulator,
};
use futures::future::FutureExt;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Collaborators shared by every node of a tree.
#[derive(Clone)]
pub struct ProvingDeps {
    pub prover: Arc<dyn Prover>,
    pub simulator: Arc<dyn Simulator>,
    pub vk_tree: Arc<VkTree>,
    pub config: OrchestratorConfig,
}

impl fmt::Debug for ProvingDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvingDeps")
            .field("vk_tree_root", &hex_head(&self.vk_tree.root()))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn hex_head(hash: &[u8; 32]) -> String {
    hash[..4].iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Aggregation circuit merging the results of two children.
///
/// Children deliver their simulation and proof through single-assignment slots, in any order.
/// [`Self::simulate`] and [`Self::prove`] are single-flight: the first call starts the
/// computation and every call, concurrent or later, observes the same result.
pub struct CircuitNode {
    level: usize,
    index: usize,
    circuit: ProvingRequestType,
    simulations: [Slot<PublicInputs>; 2],
    proofs: [Slot<ProofOutput>; 2],
    simulation: OnceLock<SharedResult<PublicInputs>>,
    proof: OnceLock<SharedResult<ProofOutput>>,
    deps: ProvingDeps,
    ctx: ProvingContext,
}

impl fmt::Debug for CircuitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitNode")
            .field("level", &self.level)
            .field("index", &self.index)
            .field("circuit", &self.circuit)
            .finish_non_exhaustive()
    }
}

fn check_index(index: usize) -> Result<(), ProvingError> {
    if index > 1 {
        return Err(ProvingError::InvalidChildIndex {
            index,
            reason: "a circuit node has exactly two children",
        });
    }
    Ok(())
}

const ALREADY_SET: &str = "child slot is already resolved";

impl CircuitNode {
    /// Creates a node for an aggregation `circuit`. Fails for circuits that do not merge two
    /// child proofs.
    pub fn new(
        level: usize,
        index: usize,
        circuit: ProvingRequestType,
        deps: ProvingDeps,
        ctx: ProvingContext,
    ) -> Result<Self, ProvingError> {
        if !circuit.is_aggregation() {
            return Err(ProvingError::fatal(format!(
                "{circuit} cannot be a tree node: it does not aggregate child proofs"
            )));
        }
        Ok(Self {
            level,
            index,
            circuit,
            simulations: [Slot::new(), Slot::new()],
            proofs: [Slot::new(), Slot::new()],
            simulation: OnceLock::new(),
            proof: OnceLock::new(),
            deps,
            ctx,
        })
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn circuit(&self) -> ProvingRequestType {
        self.circuit
    }

    pub fn set_child_simulation(
        &self,
        index: usize,
        simulation: PublicInputs,
    ) -> Result<(), ProvingError> {
        self.fill_simulation(index, Ok(simulation))
    }

    pub fn set_child_proof(&self, index: usize, proof: ProofOutput) -> Result<(), ProvingError> {
        self.fill_proof(index, Ok(proof))
    }

    /// Rejects both slots of a child. Slots already resolved keep their value.
    pub fn fail_child(&self, index: usize, error: ProvingError) -> Result<(), ProvingError> {
        check_index(index)?;
        let simulation = self.simulations[index].fill(Err(error.clone()));
        let proof = self.proofs[index].fill(Err(error));
        if simulation || proof {
            Ok(())
        } else {
            Err(ProvingError::InvalidChildIndex {
                index,
                reason: ALREADY_SET,
            })
        }
    }

    pub(crate) fn fill_simulation(
        &self,
        index: usize,
        simulation: Result<PublicInputs, ProvingError>,
    ) -> Result<(), ProvingError> {
        check_index(index)?;
        if self.simulations[index].fill(simulation) {
            Ok(())
        } else {
            Err(ProvingError::InvalidChildIndex {
                index,
                reason: ALREADY_SET,
            })
        }
    }

    pub(crate) fn fill_proof(
        &self,
        index: usize,
        proof: Result<ProofOutput, ProvingError>,
    ) -> Result<(), ProvingError> {
        check_index(index)?;
        if self.proofs[index].fill(proof) {
            Ok(())
        } else {
            Err(ProvingError::InvalidChildIndex {
                index,
                reason: ALREADY_SET,
            })
        }
    }

    /// Public inputs of this circuit, computed from the children's simulations without proving.
    pub fn simulate(&self) -> SharedResult<PublicInputs> {
        self.simulation
            .get_or_init(|| {
                let left = self.simulations[0].wait();
                let right = self.simulations[1].wait();
                let simulator = self.deps.simulator.clone();
                let circuit = self.circuit;
                async move {
                    let (left, right) = futures::try_join!(left, right)?;
                    simulator
                        .simulate(SimulationRequest {
                            circuit,
                            children: [left, right],
                        })
                        .await
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Proof of this circuit over the children's proofs.
    pub fn prove(&self) -> SharedResult<ProofOutput> {
        self.proof
            .get_or_init(|| {
                let simulation = self
                    .deps
                    .config
                    .check_simulation_consistency
                    .then(|| self.simulate());
                let job = NodeJob {
                    level: self.level,
                    index: self.index,
                    circuit: self.circuit,
                    children: [self.proofs[0].wait(), self.proofs[1].wait()],
                    deps: self.deps.clone(),
                    ctx: self.ctx.clone(),
                };
                job.run(simulation).boxed().shared()
            })
            .clone()
    }
}

/// Everything `prove()` needs, detached from the node so the future is `'static`.
struct NodeJob {
    level: usize,
    index: usize,
    circuit: ProvingRequestType,
    children: [SharedResult<ProofOutput>; 2],
    deps: ProvingDeps,
    ctx: ProvingContext,
}

impl NodeJob {
    async fn run(
        self,
        simulation: Option<SharedResult<PublicInputs>>,
    ) -> Result<ProofOutput, ProvingError> {
        let circuit = self.circuit.as_str();
        let cancel = self.ctx.cancel.clone();
        let result = tokio::select! {
            result = self.prove(simulation) => result,
            _ = cancel.cancelled() => Err(ProvingError::Cancelled),
        };
        if result.is_err() {
            TREE_METRICS.nodes_failed[&circuit].inc();
        }
        result
    }

    async fn prove(
        self,
        simulation: Option<SharedResult<PublicInputs>>,
    ) -> Result<ProofOutput, ProvingError> {
        let [left, right] = self.children;
        let (left, right) = futures::try_join!(left, right)?;
        let started = Instant::now();
        tracing::debug!(
            level = self.level,
            index = self.index,
            circuit = %self.circuit,
            "children proven, proving node"
        );

        let children = [
            child_proof(&self.deps.vk_tree, left)?,
            child_proof(&self.deps.vk_tree, right)?,
        ];
        let request = ProvingRequest::aggregation(self.circuit, AggregationInputs { children })?;
        let proving = self.deps.prover.prove(request, self.ctx.clone());
        let (output, expected) = match simulation {
            Some(simulation) => {
                let (output, expected) = futures::try_join!(proving, simulation)?;
                (output, Some(expected))
            }
            None => (proving.await?, None),
        };

        if let Some(expected) = expected {
            if expected != output.public_inputs {
                TREE_METRICS.consistency_mismatches.inc();
                tracing::error!(
                    level = self.level,
                    index = self.index,
                    circuit = %self.circuit,
                    ?expected,
                    actual = ?output.public_inputs,
                    "proof public inputs differ from simulation"
                );
                return Err(ProvingError::fatal(format!(
                    "{} at level {} index {}: proof public inputs do not match simulation",
                    self.circuit, self.level, self.index
                )));
            }
        }

        let circuit = self.circuit.as_str();
        TREE_METRICS.nodes_proven[&circuit].inc();
        TREE_METRICS.node_proving_duration[&circuit].observe(started.elapsed());
        tracing::info!(
            level = self.level,
            index = self.index,
            circuit,
            elapsed = ?started.elapsed(),
            "node proven"
        );
        Ok(output)
    }
}

fn child_proof(vk_tree: &VkTree, output: ProofOutput) -> Result<ChildProof, ProvingError> {
    let vk_witness = vk_tree.membership_witness(&output.verification_key)?;
    Ok(ChildProof {
        public_inputs: output.public_inputs,
        proof: output.proof,
        verification_key: output.verification_key,
        vk_witness,
    })
}
