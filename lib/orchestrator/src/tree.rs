use crate::node::{CircuitNode, ProvingDeps};
use crate::slot::SharedResult;
use epoch_prover_types::{
    OpaqueInputs, ProofOutput, Prover, ProvingContext, ProvingError, ProvingRequest,
    ProvingRequestType, PublicInputs, Simulator,
};
use futures::future::{self, BoxFuture, Either, FutureExt, Shared};
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, OnceLock};

/// Which part of the rollup a tree aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    /// Transactions into a block.
    Block,
    /// Blocks into an epoch.
    Epoch,
}

impl TreeKind {
    pub fn merge_circuit(self) -> ProvingRequestType {
        match self {
            TreeKind::Block => ProvingRequestType::MergeRollup,
            TreeKind::Epoch => ProvingRequestType::BlockMergeRollup,
        }
    }

    pub fn root_circuit(self) -> ProvingRequestType {
        match self {
            TreeKind::Block => ProvingRequestType::BlockRootRollup,
            TreeKind::Epoch => ProvingRequestType::RootRollup,
        }
    }

    /// Circuit of the empty leaf filling the slots past the last real leaf.
    pub fn padding_circuit(self) -> ProvingRequestType {
        match self {
            TreeKind::Block => ProvingRequestType::PrivateBaseRollup,
            TreeKind::Epoch => ProvingRequestType::EmptyBlockRootRollup,
        }
    }
}

/// Simulation and proof of one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafResult {
    pub simulation: PublicInputs,
    pub proof: ProofOutput,
}

/// Simulates and proves the empty leaf of a `kind` tree.
pub async fn prove_padding_leaf(
    prover: &dyn Prover,
    simulator: &dyn Simulator,
    kind: TreeKind,
    inputs: OpaqueInputs,
    ctx: ProvingContext,
) -> Result<LeafResult, ProvingError> {
    let request = ProvingRequest::opaque(kind.padding_circuit(), inputs)?;
    let (simulation, proof) = futures::try_join!(
        simulator.simulate_leaf(&request),
        prover.prove(request.clone(), ctx)
    )?;
    Ok(LeafResult { simulation, proof })
}

/// Binary tree of [`CircuitNode`]s merging `leaf_count` leaves into one proof.
///
/// The tree is padded to `max(2, leaf_count.next_power_of_two())` leaves. Node `(level, index)`
/// sits above nodes `(level + 1, 2 * index)` and `(level + 1, 2 * index + 1)`; the nodes of the
/// last level take the leaves as children. The root is at level 0 and runs the root circuit,
/// every other node runs the merge circuit.
pub struct ProofTree {
    kind: TreeKind,
    leaf_count: usize,
    nodes: Vec<Vec<Arc<CircuitNode>>>,
    ctx: ProvingContext,
    check_consistency: bool,
    simulation_wiring: OnceLock<Shared<BoxFuture<'static, ()>>>,
    simulation: OnceLock<SharedResult<PublicInputs>>,
    proof: OnceLock<SharedResult<ProofOutput>>,
}

impl std::fmt::Debug for ProofTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofTree")
            .field("kind", &self.kind)
            .field("leaf_count", &self.leaf_count)
            .field("levels", &self.levels())
            .finish_non_exhaustive()
    }
}

impl ProofTree {
    /// Builds every node of the tree and fills the padding leaves with `padding`.
    pub fn new(
        kind: TreeKind,
        leaf_count: usize,
        padding: LeafResult,
        deps: ProvingDeps,
    ) -> Result<Self, ProvingError> {
        if leaf_count == 0 {
            return Err(ProvingError::fatal("a proof tree needs at least one leaf"));
        }
        let width = leaf_count.next_power_of_two().max(2);
        let levels = width.trailing_zeros() as usize;
        let ctx = ProvingContext::new(deps.config.epoch_number);
        let check_consistency = deps.config.check_simulation_consistency;

        let nodes = (0..levels)
            .map(|level| {
                let circuit = if level == 0 {
                    kind.root_circuit()
                } else {
                    kind.merge_circuit()
                };
                (0..1 << level)
                    .map(|index| {
                        CircuitNode::new(level, index, circuit, deps.clone(), ctx.child())
                            .map(Arc::new)
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tree = Self {
            kind,
            leaf_count,
            nodes,
            ctx,
            check_consistency,
            simulation_wiring: OnceLock::new(),
            simulation: OnceLock::new(),
            proof: OnceLock::new(),
        };
        for leaf in leaf_count..width {
            let (node, child) = tree.leaf_parent(leaf);
            node.set_child_simulation(child, padding.simulation.clone())?;
            node.set_child_proof(child, padding.proof.clone())?;
        }
        tracing::debug!(?kind, leaf_count, width, levels, "built proof tree");
        Ok(tree)
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of node levels, i.e. `log2` of the padded leaf count.
    pub fn levels(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, level: usize, index: usize) -> Option<&Arc<CircuitNode>> {
        self.nodes.get(level)?.get(index)
    }

    pub fn root(&self) -> &Arc<CircuitNode> {
        &self.nodes[0][0]
    }

    fn leaf_parent(&self, leaf: usize) -> (&CircuitNode, usize) {
        (&self.nodes[self.levels() - 1][leaf / 2], leaf % 2)
    }

    fn real_leaf_parent(&self, leaf: usize) -> Result<(&CircuitNode, usize), ProvingError> {
        if leaf >= self.leaf_count {
            return Err(ProvingError::InvalidChildIndex {
                index: leaf,
                reason: "leaf index is past the last leaf of the tree",
            });
        }
        Ok(self.leaf_parent(leaf))
    }

    pub fn set_leaf_simulation(
        &self,
        leaf: usize,
        simulation: PublicInputs,
    ) -> Result<(), ProvingError> {
        let (node, child) = self.real_leaf_parent(leaf)?;
        node.set_child_simulation(child, simulation)
    }

    pub fn set_leaf_proof(&self, leaf: usize, proof: ProofOutput) -> Result<(), ProvingError> {
        let (node, child) = self.real_leaf_parent(leaf)?;
        node.set_child_proof(child, proof)
    }

    /// Records that a leaf will never be produced; the failure reaches the root.
    pub fn fail_leaf(&self, leaf: usize, error: ProvingError) -> Result<(), ProvingError> {
        let (node, child) = self.real_leaf_parent(leaf)?;
        node.fail_child(child, error)
    }

    /// Simulated public inputs of the root.
    pub fn simulate(&self) -> SharedResult<PublicInputs> {
        self.simulation
            .get_or_init(|| {
                drive(self.root().simulate(), self.wire_simulations())
                    .boxed()
                    .shared()
            })
            .clone()
    }

    /// Proof of the root. Proves every node as soon as both of its children are proven.
    ///
    /// If the root fails, jobs still outstanding for the rest of the tree are cancelled.
    pub fn prove(&self) -> SharedResult<ProofOutput> {
        self.proof
            .get_or_init(|| {
                let mut wiring = vec![self.wire_proofs().boxed()];
                if self.check_consistency {
                    wiring.push(self.wire_simulations().boxed());
                }
                let root = self.root().prove();
                let cancel = self.ctx.cancel.clone();
                let (kind, leaf_count) = (self.kind, self.leaf_count);
                async move {
                    let result = drive(root, future::join_all(wiring)).await;
                    match &result {
                        Ok(_) => tracing::info!(?kind, leaf_count, "proof tree proven"),
                        Err(err) => {
                            tracing::warn!(?kind, leaf_count, %err, "proof tree failed");
                            cancel.cancel();
                        }
                    }
                    result
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Best-effort cancellation of every job still outstanding for this tree. Nodes already
    /// proven keep their proofs.
    pub fn cancel(&self) {
        tracing::info!(kind = ?self.kind, leaf_count = self.leaf_count, "cancelling proof tree");
        self.ctx.cancel.cancel();
    }

    /// Pushes every non-root node's result into its parent's slot.
    fn wire<T, F>(&self, resolve: F) -> impl Future<Output = ()> + Send + 'static
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&CircuitNode) -> (SharedResult<T>, ParentFill<T>),
    {
        let mut wiring = Vec::new();
        for level in 1..self.levels() {
            for (index, node) in self.nodes[level].iter().enumerate() {
                let parent = self.nodes[level - 1][index / 2].clone();
                let child = index % 2;
                let (result, fill) = resolve(node);
                let (level, node_index) = (node.level(), node.index());
                wiring.push(async move {
                    if let Err(err) = fill(parent.as_ref(), child, result.await) {
                        tracing::warn!(level, index = node_index, %err, "cannot pass result to parent");
                    }
                });
            }
        }
        future::join_all(wiring).map(drop)
    }

    fn wire_proofs(&self) -> impl Future<Output = ()> + Send + 'static {
        self.wire(|node| (
                node.prove(),
                CircuitNode::fill_proof as ParentFill<ProofOutput>,
            ))
    }

    fn wire_simulations(&self) -> Shared<BoxFuture<'static, ()>> {
        self.simulation_wiring
            .get_or_init(|| {
                self.wire(|node| (
                    node.simulate(),
                    CircuitNode::fill_simulation as ParentFill<PublicInputs>,
                ))
                    .boxed()
                    .shared()
            })
            .clone()
    }
}

type ParentFill<T> = fn(&CircuitNode, usize, Result<T, ProvingError>) -> Result<(), ProvingError>;

/// Polls `root` while `wiring` propagates results up the tree. Returns as soon as the root
/// resolves, even if other branches are still running.
async fn drive<T, W>(root: SharedResult<T>, wiring: W) -> Result<T, ProvingError>
where
    T: Clone + Send + Sync + 'static,
    W: Future,
{
    let root = pin!(root);
    let wiring = pin!(wiring);
    match future::select(root, wiring).await {
        Either::Left((result, _)) => result,
        Either::Right((_, root)) => root.await,
    }
}
