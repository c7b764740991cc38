//! End-to-end harness: a broker, proving agents and a broker-backed proof tree in one process,
//! optionally talking to each other over the broker's HTTP API.

use async_trait::async_trait;
use epoch_prover_agent::{AgentConfig, ProvingAgent};
use epoch_prover_broker::{
    BrokerConfig, BrokerError, InMemoryDatabase, ProvingBroker, ProvingBrokerClient,
    ProvingJobConsumer, ProvingJobProducer, http,
};
use epoch_prover_orchestrator::{
    BrokerProverFacade, FacadeConfig, LeafResult, OrchestratorConfig, ProofTree, ProvingDeps,
    TreeKind, prove_padding_leaf,
};
use epoch_prover_proof_store::{ProofStore, ProofStoreConfig};
use epoch_prover_types::vk_tree::VkTree;
use epoch_prover_types::{
    JobStatus, OpaqueInputs, Proof, ProofOutput, Prover, ProverError, ProvingContext,
    ProvingError, ProvingJob, ProvingJobId, ProvingRequest, ProvingRequestType, PublicInputs,
    SimulationRequest, Simulator, VerificationKey,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::iter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Deterministic stand-in for the real circuits.
///
/// Public inputs of a leaf are the hash of its inputs; those of an aggregation are the hash of
/// the circuit name and both children's public inputs. Every circuit has its own verification
/// key, all of them in [`Self::vk_tree`].
#[derive(Debug)]
pub struct MockCircuits {
    pub vk_tree: Arc<VkTree>,
    calls: Mutex<HashMap<ProvingRequestType, usize>>,
    failing: Mutex<HashSet<ProvingRequestType>>,
}

impl MockCircuits {
    pub fn new() -> Arc<Self> {
        let vk_tree = VkTree::new(ProvingRequestType::ALL.map(Self::verification_key));
        Arc::new(Self {
            vk_tree: Arc::new(vk_tree),
            calls: Mutex::default(),
            failing: Mutex::default(),
        })
    }

    pub fn verification_key(circuit: ProvingRequestType) -> VerificationKey {
        VerificationKey(format!("vk:{circuit}").into_bytes())
    }

    pub fn aggregate(
        circuit: ProvingRequestType,
        left: &PublicInputs,
        right: &PublicInputs,
    ) -> PublicInputs {
        let mut hasher = Sha256::new();
        hasher.update(circuit.as_str());
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        PublicInputs(hasher.finalize().to_vec())
    }

    pub fn leaf_public_inputs(inputs: &OpaqueInputs) -> PublicInputs {
        PublicInputs(Sha256::digest(inputs.as_bytes()).to_vec())
    }

    /// Public inputs the root of a `kind` tree over `leaves` ends up with, computed without
    /// going through the tree. Padding leaves are built from empty inputs.
    pub fn expected_root(kind: TreeKind, leaves: &[PublicInputs]) -> PublicInputs {
        let width = leaves.len().next_power_of_two().max(2);
        let padding = Self::leaf_public_inputs(&OpaqueInputs::default());
        let mut level: Vec<_> = leaves
            .iter()
            .cloned()
            .chain(iter::repeat(padding))
            .take(width)
            .collect();
        while level.len() > 1 {
            let circuit = if level.len() == 2 {
                kind.root_circuit()
            } else {
                kind.merge_circuit()
            };
            level = level
                .chunks(2)
                .map(|pair| Self::aggregate(circuit, &pair[0], &pair[1]))
                .collect();
        }
        level.swap_remove(0)
    }

    /// Result of a transaction leaf, as a base rollup prover outside the tree would produce it.
    pub fn leaf(tag: u8) -> LeafResult {
        let public_inputs = Self::leaf_public_inputs(&OpaqueInputs(vec![tag]));
        LeafResult {
            simulation: public_inputs.clone(),
            proof: ProofOutput {
                public_inputs,
                proof: Proof(vec![tag; 32]),
                verification_key: Self::verification_key(ProvingRequestType::PrivateBaseRollup),
            },
        }
    }

    /// Makes every proof of `circuit` fail with a retryable error.
    pub fn fail_transiently(&self, circuit: ProvingRequestType) {
        self.failing.lock().unwrap().insert(circuit);
    }

    pub fn calls(&self, circuit: ProvingRequestType) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&circuit)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Prover for MockCircuits {
    async fn prove(
        &self,
        request: ProvingRequest,
        _ctx: ProvingContext,
    ) -> Result<ProofOutput, ProvingError> {
        let circuit = request.request_type();
        *self.calls.lock().unwrap().entry(circuit).or_default() += 1;
        if self.failing.lock().unwrap().contains(&circuit) {
            return Err(ProverError::ResourceExhausted(format!("no GPU left for {circuit}")).into());
        }

        let public_inputs = match request.aggregation_inputs() {
            Some(inputs) => {
                let root = self.vk_tree.root();
                for child in &inputs.children {
                    if !child.vk_witness.verify(&root, &child.verification_key) {
                        return Err(
                            ProverError::MalformedInput("unrecognized child VK".into()).into()
                        );
                    }
                }
                let [left, right] = &inputs.children;
                Self::aggregate(circuit, &left.public_inputs, &right.public_inputs)
            }
            None => match &request {
                ProvingRequest::PrivateBaseRollup(inputs)
                | ProvingRequest::EmptyBlockRootRollup(inputs) => Self::leaf_public_inputs(inputs),
                _ => {
                    return Err(ProverError::MalformedInput(format!(
                        "{circuit} is not a mock circuit"
                    ))
                    .into());
                }
            },
        };
        Ok(ProofOutput {
            proof: Proof(public_inputs.0.iter().rev().copied().collect()),
            public_inputs,
            verification_key: Self::verification_key(circuit),
        })
    }
}

#[async_trait]
impl Simulator for MockCircuits {
    async fn simulate(&self, request: SimulationRequest) -> Result<PublicInputs, ProvingError> {
        let [left, right] = &request.children;
        Ok(Self::aggregate(request.circuit, left, right))
    }

    async fn simulate_leaf(&self, request: &ProvingRequest) -> Result<PublicInputs, ProvingError> {
        match request {
            ProvingRequest::PrivateBaseRollup(inputs)
            | ProvingRequest::EmptyBlockRootRollup(inputs) => Ok(Self::leaf_public_inputs(inputs)),
            other => Err(ProvingError::fatal(format!(
                "cannot simulate {}",
                other.request_type()
            ))),
        }
    }
}

/// Producer counting the jobs enqueued through it, per circuit.
pub struct EnqueueCounter {
    inner: Arc<dyn ProvingJobProducer>,
    counts: Mutex<HashMap<ProvingRequestType, usize>>,
}

impl EnqueueCounter {
    pub fn new(inner: Arc<dyn ProvingJobProducer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            counts: Mutex::default(),
        })
    }

    pub fn count(&self, circuit: ProvingRequestType) -> usize {
        self.counts
            .lock()
            .unwrap()
            .get(&circuit)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProvingJobProducer for EnqueueCounter {
    async fn enqueue_proving_job(&self, job: ProvingJob) -> Result<JobStatus, BrokerError> {
        *self.counts.lock().unwrap().entry(job.ty).or_default() += 1;
        self.inner.enqueue_proving_job(job).await
    }

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> Result<JobStatus, BrokerError> {
        self.inner.get_proving_job_status(id).await
    }

    async fn cancel_proving_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.inner.cancel_proving_job(id).await
    }

    async fn get_completed_jobs(
        &self,
        ids: &[ProvingJobId],
    ) -> Result<Vec<ProvingJobId>, BrokerError> {
        self.inner.get_completed_jobs(ids).await
    }

    async fn clean_up_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.inner.clean_up_job(id).await
    }
}

#[derive(Debug, Clone)]
pub struct TesterConfig {
    pub broker: BrokerConfig,
    pub agent: AgentConfig,
    /// Number of agents, each running `agent.concurrency` slots.
    pub agents: usize,
    /// Route producer and agents through the broker's HTTP API.
    pub over_http: bool,
    pub check_simulation_consistency: bool,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                job_timeout: Duration::from_secs(5),
                timeout_interval: Duration::from_millis(100),
                ..BrokerConfig::default()
            },
            agent: AgentConfig {
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(100),
                ..AgentConfig::default()
            },
            agents: 1,
            over_http: false,
            check_simulation_consistency: true,
        }
    }
}

pub struct Tester {
    pub broker: Arc<ProvingBroker>,
    pub enqueued: Arc<EnqueueCounter>,
    pub facade: Arc<BrokerProverFacade>,
    pub circuits: Arc<MockCircuits>,
    pub proof_store: Arc<dyn ProofStore>,
    /// Consumer side of the broker, as the agents see it.
    pub consumer: Arc<dyn ProvingJobConsumer>,
    config: TesterConfig,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _proof_dir: TempDir,
}

impl Tester {
    pub async fn setup() -> anyhow::Result<Self> {
        Self::with_config(TesterConfig::default()).await
    }

    pub async fn with_config(config: TesterConfig) -> anyhow::Result<Self> {
        let stop = CancellationToken::new();
        let mut tasks = Vec::new();
        let broker = Arc::new(ProvingBroker::new(
            config.broker.clone(),
            Arc::new(InMemoryDatabase::new()),
        ));
        broker.start()?;
        tasks.push(tokio::spawn({
            let broker = broker.clone();
            let stop = stop.clone();
            async move {
                if let Err(err) = broker.run_timeout_loop(stop).await {
                    tracing::error!(%err, "timeout loop failed");
                }
            }
        }));

        let (producer, consumer): (Arc<dyn ProvingJobProducer>, Arc<dyn ProvingJobConsumer>) =
            if config.over_http {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let url = format!("http://{}", listener.local_addr()?);
                tasks.push(tokio::spawn({
                    let broker = broker.clone();
                    let stop = stop.clone();
                    async move {
                        if let Err(err) = http::serve(listener, broker, 64 << 20, stop).await {
                            tracing::error!(%err, "broker HTTP server failed");
                        }
                    }
                }));
                tracing::info!(%url, "broker API is up");
                let client = Arc::new(
                    ProvingBrokerClient::new(&url)?.with_retries(3, Duration::from_millis(10)),
                );
                let producer: Arc<dyn ProvingJobProducer> = client.clone();
                let consumer: Arc<dyn ProvingJobConsumer> = client;
                (producer, consumer)
            } else {
                let producer: Arc<dyn ProvingJobProducer> = broker.clone();
                let consumer: Arc<dyn ProvingJobConsumer> = broker.clone();
                (producer, consumer)
            };

        let proof_dir = tempfile::tempdir()?;
        let proof_store = ProofStoreConfig {
            directory: Some(proof_dir.path().to_path_buf()),
        }
        .build()
        .await?;
        let circuits = MockCircuits::new();

        let enqueued = EnqueueCounter::new(producer);
        let facade = Arc::new(BrokerProverFacade::new(
            enqueued.clone(),
            proof_store.clone(),
            FacadeConfig {
                poll_interval: Duration::from_millis(10),
                snapshot_sync_interval: Duration::from_millis(200),
            },
        ));
        facade.start();

        let mut tester = Self {
            broker,
            enqueued,
            facade,
            circuits,
            proof_store,
            consumer,
            config,
            stop,
            tasks,
            _proof_dir: proof_dir,
        };
        for index in 0..tester.config.agents {
            tester.spawn_agent(&format!("agent-{index}"))?;
        }
        Ok(tester)
    }

    /// Starts one more proving agent backed by [`MockCircuits`].
    pub fn spawn_agent(&mut self, agent_id: &str) -> anyhow::Result<()> {
        let config = AgentConfig {
            agent_id: agent_id.to_owned(),
            ..self.config.agent.clone()
        };
        let agent = Arc::new(ProvingAgent::new(
            self.consumer.clone(),
            self.proof_store.clone(),
            self.circuits.clone(),
            config,
        )?);
        self.tasks.push(tokio::spawn(agent.run(self.stop.clone())));
        Ok(())
    }

    pub fn deps(&self) -> ProvingDeps {
        ProvingDeps {
            prover: self.facade.clone(),
            simulator: self.circuits.clone(),
            vk_tree: self.circuits.vk_tree.clone(),
            config: OrchestratorConfig {
                check_simulation_consistency: self.config.check_simulation_consistency,
                epoch_number: 1,
            },
        }
    }

    /// Proves the padding leaf of a `kind` tree through the broker.
    pub async fn padding_leaf(&self, kind: TreeKind) -> anyhow::Result<LeafResult> {
        Ok(prove_padding_leaf(
            self.facade.as_ref(),
            self.circuits.as_ref(),
            kind,
            OpaqueInputs::default(),
            ProvingContext::new(1),
        )
        .await?)
    }

    pub async fn tree(&self, kind: TreeKind, leaf_count: usize) -> anyhow::Result<ProofTree> {
        let padding = self.padding_leaf(kind).await?;
        Ok(ProofTree::new(kind, leaf_count, padding, self.deps())?)
    }

    pub async fn shutdown(mut self) {
        self.facade.stop().await;
        self.stop.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::error!(%err, "test task panicked");
            }
        }
    }
}

impl Drop for Tester {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
