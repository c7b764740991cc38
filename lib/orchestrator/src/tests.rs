use crate::{
    BrokerProverFacade, CircuitNode, FacadeConfig, LeafResult, OrchestratorConfig, ProofTree,
    ProvingDeps, TreeKind, prove_padding_leaf,
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use epoch_prover_broker::{
    BrokerConfig, InMemoryDatabase, ProvingBroker, ProvingJobConsumer, ProvingJobProducer,
};
use epoch_prover_proof_store::{InlineProofStore, ProofStore};
use epoch_prover_types::vk_tree::VkTree;
use epoch_prover_types::{
    AgentId, JobLease, OpaqueInputs, Proof, ProofOutput, Prover, ProvingContext, ProvingError,
    ProvingJobFilter, ProvingRequest, ProvingRequestType, PublicInputs, SimulationRequest,
    Simulator, VerificationKey,
};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

fn vk() -> VerificationKey {
    VerificationKey(b"rollup-vk".to_vec())
}

fn aggregate(
    circuit: ProvingRequestType,
    left: &PublicInputs,
    right: &PublicInputs,
) -> PublicInputs {
    let mut bytes = vec![circuit as u8, left.0.len() as u8];
    bytes.extend_from_slice(&left.0);
    bytes.extend_from_slice(&right.0);
    PublicInputs(bytes)
}

struct FakeSimulator;

#[async_trait]
impl Simulator for FakeSimulator {
    async fn simulate(&self, request: SimulationRequest) -> Result<PublicInputs, ProvingError> {
        let [left, right] = &request.children;
        Ok(aggregate(request.circuit, left, right))
    }

    async fn simulate_leaf(&self, request: &ProvingRequest) -> Result<PublicInputs, ProvingError> {
        match request {
            ProvingRequest::PrivateBaseRollup(inputs)
            | ProvingRequest::EmptyBlockRootRollup(inputs) => Ok(PublicInputs(inputs.0.clone())),
            other => Err(ProvingError::fatal(format!(
                "cannot simulate {}",
                other.request_type()
            ))),
        }
    }
}

/// Proves aggregations by concatenation after checking every child's VK witness.
struct FakeProver {
    vk_tree: Arc<VkTree>,
    calls: AtomicUsize,
    corrupt: AtomicBool,
    hang: AtomicBool,
}

impl FakeProver {
    fn new(vk_tree: Arc<VkTree>) -> Arc<Self> {
        Arc::new(Self {
            vk_tree,
            calls: AtomicUsize::new(0),
            corrupt: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Prover for FakeProver {
    async fn prove(
        &self,
        request: ProvingRequest,
        ctx: ProvingContext,
    ) -> Result<ProofOutput, ProvingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            ctx.cancel.cancelled().await;
            return Err(ProvingError::Cancelled);
        }
        let mut public_inputs = match (&request, request.aggregation_inputs()) {
            (_, Some(inputs)) => {
                let root = self.vk_tree.root();
                for child in &inputs.children {
                    if !child.vk_witness.verify(&root, &child.verification_key) {
                        return Err(ProvingError::fatal("child VK is not recognized"));
                    }
                }
                let [left, right] = &inputs.children;
                aggregate(
                    request.request_type(),
                    &left.public_inputs,
                    &right.public_inputs,
                )
            }
            (
                ProvingRequest::PrivateBaseRollup(inputs)
                | ProvingRequest::EmptyBlockRootRollup(inputs),
                None,
            ) => PublicInputs(inputs.0.clone()),
            (other, None) => {
                return Err(ProvingError::fatal(format!(
                    "cannot prove {}",
                    other.request_type()
                )));
            }
        };
        if self.corrupt.load(Ordering::SeqCst) {
            public_inputs.0.push(0xff);
        }
        Ok(ProofOutput {
            public_inputs,
            proof: Proof(vec![0x50; 8]),
            verification_key: vk(),
        })
    }
}

struct Fixture {
    prover: Arc<FakeProver>,
    deps: ProvingDeps,
}

impl Fixture {
    fn new(check_simulation_consistency: bool) -> Self {
        let vk_tree = Arc::new(VkTree::new([vk(), VerificationKey(b"other-vk".to_vec())]));
        let prover = FakeProver::new(vk_tree.clone());
        let deps = ProvingDeps {
            prover: prover.clone(),
            simulator: Arc::new(FakeSimulator),
            vk_tree,
            config: OrchestratorConfig {
                check_simulation_consistency,
                epoch_number: 1,
            },
        };
        Self { prover, deps }
    }

    fn leaf(tag: u8) -> LeafResult {
        let public_inputs = PublicInputs(vec![tag]);
        LeafResult {
            simulation: public_inputs.clone(),
            proof: ProofOutput {
                public_inputs,
                proof: Proof(vec![tag; 4]),
                verification_key: vk(),
            },
        }
    }

    fn tree(&self, kind: TreeKind, leaf_count: usize) -> ProofTree {
        ProofTree::new(kind, leaf_count, Self::leaf(0), self.deps.clone()).unwrap()
    }

    fn node(&self, circuit: ProvingRequestType) -> CircuitNode {
        CircuitNode::new(0, 0, circuit, self.deps.clone(), ProvingContext::new(1)).unwrap()
    }
}

#[test]
fn tree_shape_follows_leaf_count() {
    let fixture = Fixture::new(false);
    for (leaf_count, levels) in [(1, 1), (2, 1), (3, 2), (4, 2), (5, 3), (8, 3), (9, 4)] {
        let tree = fixture.tree(TreeKind::Block, leaf_count);
        assert_eq!(tree.levels(), levels, "leaf_count = {leaf_count}");
        for level in 0..levels {
            assert!(tree.node(level, (1 << level) - 1).is_some());
            assert!(tree.node(level, 1 << level).is_none());
        }
        assert!(tree.node(levels, 0).is_none());
        assert_eq!(
            tree.root().circuit(),
            ProvingRequestType::BlockRootRollup
        );
        if levels > 1 {
            assert_eq!(
                tree.node(levels - 1, 0).unwrap().circuit(),
                ProvingRequestType::MergeRollup
            );
        }
    }

    let epoch = fixture.tree(TreeKind::Epoch, 3);
    assert_eq!(epoch.root().circuit(), ProvingRequestType::RootRollup);
    assert_eq!(
        epoch.node(1, 1).unwrap().circuit(),
        ProvingRequestType::BlockMergeRollup
    );

    assert_matches!(
        ProofTree::new(TreeKind::Block, 0, Fixture::leaf(0), fixture.deps.clone()),
        Err(ProvingError::Fatal(_))
    );
}

#[test]
fn padding_slots_are_filled_and_leaf_indices_checked() {
    let fixture = Fixture::new(false);
    let tree = fixture.tree(TreeKind::Block, 3);
    // Leaf 3 is padding: it is filled already and not addressable.
    assert_matches!(
        tree.set_leaf_proof(3, Fixture::leaf(3).proof),
        Err(ProvingError::InvalidChildIndex { index: 3, .. })
    );
    tree.set_leaf_proof(2, Fixture::leaf(2).proof).unwrap();
    assert_matches!(
        tree.set_leaf_proof(2, Fixture::leaf(2).proof),
        Err(ProvingError::InvalidChildIndex { index: 0, .. })
    );
}

#[test]
fn nodes_only_accept_two_children_once() {
    let fixture = Fixture::new(false);
    let node = fixture.node(ProvingRequestType::MergeRollup);
    let leaf = Fixture::leaf(1);

    assert_matches!(
        node.set_child_proof(2, leaf.proof.clone()),
        Err(ProvingError::InvalidChildIndex { index: 2, .. })
    );
    node.set_child_proof(1, leaf.proof.clone()).unwrap();
    assert_matches!(
        node.set_child_proof(1, leaf.proof.clone()),
        Err(ProvingError::InvalidChildIndex { index: 1, .. })
    );
    node.set_child_simulation(1, leaf.simulation.clone()).unwrap();
    assert_matches!(
        node.fail_child(1, ProvingError::Cancelled),
        Err(ProvingError::InvalidChildIndex { index: 1, .. })
    );

    assert_matches!(
        CircuitNode::new(
            0,
            0,
            ProvingRequestType::Tube,
            fixture.deps.clone(),
            ProvingContext::new(1)
        ),
        Err(ProvingError::Fatal(_))
    );
}

#[tokio::test]
async fn node_proving_is_single_flight() {
    let fixture = Fixture::new(true);
    let node = fixture.node(ProvingRequestType::MergeRollup);
    let calls: Vec<_> = (0..8).map(|_| node.prove()).collect();

    // Children arrive after the callers started waiting, in reverse order.
    for (index, tag) in [(1, 2), (0, 1)] {
        let leaf = Fixture::leaf(tag);
        node.set_child_proof(index, leaf.proof).unwrap();
        node.set_child_simulation(index, leaf.simulation).unwrap();
    }

    let expected = aggregate(
        ProvingRequestType::MergeRollup,
        &PublicInputs(vec![1]),
        &PublicInputs(vec![2]),
    );
    for result in join_all(calls).await {
        assert_eq!(result.unwrap().public_inputs, expected);
    }
    assert_eq!(node.prove().await.unwrap().public_inputs, expected);
    assert_eq!(node.simulate().await.unwrap(), expected);
    assert_eq!(fixture.prover.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tree_proves_root_over_padded_leaves() {
    let fixture = Fixture::new(true);
    let padding = prove_padding_leaf(
        fixture.prover.as_ref(),
        &FakeSimulator,
        TreeKind::Block,
        OpaqueInputs(vec![0]),
        ProvingContext::new(1),
    )
    .await
    .unwrap();
    assert_eq!(padding.simulation, PublicInputs(vec![0]));
    assert_eq!(padding.proof.public_inputs, padding.simulation);

    let tree = ProofTree::new(TreeKind::Block, 3, padding.clone(), fixture.deps.clone()).unwrap();
    let root = tree.prove();
    for leaf in [2, 0, 1] {
        let result = Fixture::leaf(leaf as u8 + 1);
        tree.set_leaf_simulation(leaf, result.simulation).unwrap();
        tree.set_leaf_proof(leaf, result.proof).unwrap();
    }

    let merge = ProvingRequestType::MergeRollup;
    let expected = aggregate(
        ProvingRequestType::BlockRootRollup,
        &aggregate(merge, &PublicInputs(vec![1]), &PublicInputs(vec![2])),
        &aggregate(merge, &PublicInputs(vec![3]), &padding.simulation),
    );
    assert_eq!(root.await.unwrap().public_inputs, expected);
    assert_eq!(tree.simulate().await.unwrap(), expected);
    // Padding leaf, two merges and the root.
    assert_eq!(fixture.prover.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn simulation_mismatch_is_fatal() {
    let fixture = Fixture::new(true);
    fixture.prover.corrupt.store(true, Ordering::SeqCst);
    let tree = fixture.tree(TreeKind::Epoch, 2);
    for leaf in 0..2 {
        let result = Fixture::leaf(leaf as u8 + 1);
        tree.set_leaf_simulation(leaf, result.simulation).unwrap();
        tree.set_leaf_proof(leaf, result.proof).unwrap();
    }
    let err = tree.prove().await.unwrap_err();
    assert_matches!(&err, ProvingError::Fatal(reason) if reason.contains("do not match"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn consistency_check_can_be_disabled() {
    let fixture = Fixture::new(false);
    fixture.prover.corrupt.store(true, Ordering::SeqCst);
    let tree = fixture.tree(TreeKind::Block, 2);
    for leaf in 0..2 {
        tree.set_leaf_proof(leaf, Fixture::leaf(leaf as u8 + 1).proof)
            .unwrap();
    }
    // Simulations were never provided; with the check off they are not needed.
    assert!(tree.prove().await.is_ok());
}

#[tokio::test]
async fn leaf_failure_reaches_the_root() {
    let fixture = Fixture::new(false);
    let tree = fixture.tree(TreeKind::Block, 4);
    let root = tree.prove();
    for leaf in 1..4 {
        tree.set_leaf_proof(leaf, Fixture::leaf(leaf as u8).proof)
            .unwrap();
    }
    tree.fail_leaf(0, ProvingError::transient("leaf prover crashed"))
        .unwrap();

    assert_eq!(
        root.await.unwrap_err(),
        ProvingError::transient("leaf prover crashed")
    );
    // The failed branch never reached the prover.
    assert!(fixture.prover.calls.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn unrecognized_child_vk_is_fatal() {
    let fixture = Fixture::new(false);
    let node = fixture.node(ProvingRequestType::BlockMergeRollup);
    let mut foreign = Fixture::leaf(1).proof;
    foreign.verification_key = VerificationKey(b"foreign-vk".to_vec());
    node.set_child_proof(0, foreign).unwrap();
    node.set_child_proof(1, Fixture::leaf(2).proof).unwrap();

    assert_matches!(node.prove().await, Err(ProvingError::Fatal(_)));
    assert_eq!(fixture.prover.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelling_tree_rejects_pending_nodes() {
    let fixture = Fixture::new(false);
    let tree = fixture.tree(TreeKind::Block, 2);
    let done = tree.prove();
    fixture.prover.hang.store(true, Ordering::SeqCst);
    tree.set_leaf_proof(0, Fixture::leaf(1).proof).unwrap();
    tree.set_leaf_proof(1, Fixture::leaf(2).proof).unwrap();

    let handle = tokio::spawn(done);
    tokio::time::sleep(Duration::from_millis(20)).await;
    tree.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(ProvingError::Cancelled));
}

struct FacadeFixture {
    broker: Arc<ProvingBroker>,
    store: Arc<dyn ProofStore>,
    facade: Arc<BrokerProverFacade>,
}

impl FacadeFixture {
    fn new(max_retries: u32) -> Self {
        let config = BrokerConfig {
            max_retries,
            ..BrokerConfig::default()
        };
        let broker = Arc::new(ProvingBroker::new(config, Arc::new(InMemoryDatabase::new())));
        broker.start().unwrap();
        let store: Arc<dyn ProofStore> = Arc::new(InlineProofStore);
        let facade = Arc::new(BrokerProverFacade::new(
            broker.clone(),
            store.clone(),
            FacadeConfig {
                poll_interval: Duration::from_millis(5),
                snapshot_sync_interval: Duration::from_millis(50),
            },
        ));
        facade.start();
        Self {
            broker,
            store,
            facade,
        }
    }

    fn request(tag: u8) -> ProvingRequest {
        ProvingRequest::Tube(OpaqueInputs(vec![tag]))
    }

    fn prove(&self, tag: u8, ctx: ProvingContext) -> JoinHandle<Result<ProofOutput, ProvingError>> {
        let facade = self.facade.clone();
        tokio::spawn(async move { facade.prove(Self::request(tag), ctx).await })
    }

    async fn next_job(&self) -> JobLease {
        let filter = ProvingJobFilter::any(AgentId::new("test"));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(lease) = self.broker.get_proving_job(&filter).await.unwrap() {
                    return lease;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no job was enqueued")
    }

    async fn complete(&self, lease: &JobLease) -> ProofOutput {
        let request = self.store.get_proof_input(&lease.job.inputs).await.unwrap();
        let ProvingRequest::Tube(OpaqueInputs(bytes)) = request else {
            panic!("unexpected request {request:?}");
        };
        let output = ProofOutput {
            public_inputs: PublicInputs(bytes),
            proof: Proof(vec![1]),
            verification_key: vk(),
        };
        let result_ref = self
            .store
            .save_proof_output(&lease.job.id, lease.job.ty, &output)
            .await
            .unwrap();
        self.broker
            .report_proving_job_success(&lease.job.id, result_ref)
            .await
            .unwrap();
        output
    }
}

#[tokio::test]
async fn facade_shares_identical_requests() {
    let fixture = FacadeFixture::new(3);
    let first = fixture.prove(7, ProvingContext::new(1));
    let lease = fixture.next_job().await;
    let second = fixture.prove(7, ProvingContext::new(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fixture.facade.jobs_in_flight(), 1);
    assert_eq!(fixture.broker.status_summary().in_progress, 1);
    assert_eq!(fixture.broker.status_summary().queued, 0);

    let output = fixture.complete(&lease).await;
    assert_eq!(first.await.unwrap().unwrap(), output);
    assert_eq!(second.await.unwrap().unwrap(), output);
    assert_eq!(fixture.facade.jobs_in_flight(), 0);
    // Consumed jobs are cleaned up at the broker.
    assert_matches!(
        fixture.broker.get_proving_job_status(&lease.job.id).await,
        Err(epoch_prover_broker::BrokerError::JobNotFound(_))
    );
    fixture.facade.stop().await;
}

#[tokio::test]
async fn facade_maps_failures() {
    let fixture = FacadeFixture::new(0);

    let fatal = fixture.prove(1, ProvingContext::new(1));
    let lease = fixture.next_job().await;
    fixture
        .broker
        .report_proving_job_error(&lease.job.id, "bad witness".into(), false, None)
        .await
        .unwrap();
    assert_matches!(
        fatal.await.unwrap(),
        Err(ProvingError::Fatal(reason)) if reason == "bad witness"
    );

    let exhausted = fixture.prove(2, ProvingContext::new(1));
    let lease = fixture.next_job().await;
    fixture
        .broker
        .report_proving_job_error(&lease.job.id, "out of memory".into(), true, None)
        .await
        .unwrap();
    assert_matches!(
        exhausted.await.unwrap(),
        Err(ProvingError::MaxRetriesExceeded { id, .. }) if id == lease.job.id
    );
    fixture.facade.stop().await;
}

#[tokio::test]
async fn facade_cancels_jobs_of_cancelled_requests() {
    let fixture = FacadeFixture::new(3);
    let ctx = ProvingContext::new(1);
    let pending = fixture.prove(3, ctx.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fixture.broker.status_summary().queued, 1);

    ctx.cancel.cancel();
    assert_eq!(pending.await.unwrap(), Err(ProvingError::Cancelled));
    assert_eq!(fixture.facade.jobs_in_flight(), 0);
    let filter = ProvingJobFilter::any(AgentId::new("test"));
    assert!(fixture.broker.get_proving_job(&filter).await.unwrap().is_none());
    fixture.facade.stop().await;
}

#[tokio::test]
async fn stopping_facade_rejects_outstanding_requests() {
    let fixture = FacadeFixture::new(3);
    let pending = fixture.prove(4, ProvingContext::new(1));
    fixture.next_job().await;

    fixture.facade.stop().await;
    assert_eq!(pending.await.unwrap(), Err(ProvingError::Cancelled));
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn cancelling_tree_withdraws_its_broker_jobs() {
    let fixture = FacadeFixture::new(3);
    let deps = ProvingDeps {
        prover: fixture.facade.clone(),
        ..Fixture::new(false).deps
    };

    for round in 0..20u8 {
        let tree = ProofTree::new(TreeKind::Block, 2, Fixture::leaf(0), deps.clone()).unwrap();
        let done = tokio::spawn(tree.prove());
        tree.set_leaf_proof(0, Fixture::leaf(2 * round + 1).proof)
            .unwrap();
        tree.set_leaf_proof(1, Fixture::leaf(2 * round + 2).proof)
            .unwrap();
        eventually("the root job to be queued", || {
            fixture.broker.status_summary().queued == 1
        })
        .await;

        tree.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ProvingError::Cancelled), "round {round}");
        eventually("the root job to be withdrawn", || {
            let summary = fixture.broker.status_summary();
            summary.queued == 0 && summary.in_progress == 0
        })
        .await;
        eventually("the facade to forget the job", || {
            fixture.facade.jobs_in_flight() == 0
        })
        .await;
    }

    let filter = ProvingJobFilter::any(AgentId::new("test"));
    assert!(fixture.broker.get_proving_job(&filter).await.unwrap().is_none());
    fixture.facade.stop().await;
}

#[tokio::test]
async fn dropped_request_cancels_its_job_once_unshared() {
    let fixture = FacadeFixture::new(3);
    let first = fixture.prove(5, ProvingContext::new(1));
    let lease = fixture.next_job().await;
    let second = fixture.prove(5, ProvingContext::new(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fixture.facade.jobs_in_flight(), 1);

    // The job survives as long as someone still waits for it.
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fixture.facade.jobs_in_flight(), 1);
    assert_eq!(fixture.broker.status_summary().in_progress, 1);

    second.abort();
    assert!(second.await.unwrap_err().is_cancelled());
    eventually("the job to be withdrawn", || {
        fixture.facade.jobs_in_flight() == 0
            && fixture.broker.status_summary().in_progress == 0
    })
    .await;
    let status = fixture.broker.get_proving_job_status(&lease.job.id).await;
    assert_matches!(status, Err(epoch_prover_broker::BrokerError::JobNotFound(_)));
    fixture.facade.stop().await;
}
