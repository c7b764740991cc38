use epoch_prover_agent::AgentConfig;
use epoch_prover_integration_tests::{MockCircuits, Tester, TesterConfig};
use epoch_prover_orchestrator::TreeKind;
use epoch_prover_types::ProvingRequestType;
use std::time::Duration;

#[test_log::test(tokio::test)]
async fn epoch_tree_over_http() -> anyhow::Result<()> {
    let defaults = TesterConfig::default();
    let tester = Tester::with_config(TesterConfig {
        agent: AgentConfig {
            concurrency: 2,
            ..defaults.agent.clone()
        },
        agents: 2,
        over_http: true,
        ..defaults
    })
    .await?;
    let tree = tester.tree(TreeKind::Epoch, 5).await?;
    assert_eq!(tree.levels(), 3);

    // Leaves arrive out of order, proofs before simulations.
    let leaves: Vec<_> = (0..5).map(MockCircuits::leaf).collect();
    for (index, leaf) in leaves.iter().enumerate().rev() {
        tree.set_leaf_proof(index, leaf.proof.clone())?;
    }
    for (index, leaf) in leaves.iter().enumerate() {
        tree.set_leaf_simulation(index, leaf.simulation.clone())?;
    }

    let root = tokio::time::timeout(Duration::from_secs(30), tree.prove()).await??;
    let simulations: Vec<_> = leaves.iter().map(|leaf| leaf.simulation.clone()).collect();
    assert_eq!(
        root.public_inputs,
        MockCircuits::expected_root(TreeKind::Epoch, &simulations)
    );
    assert_eq!(
        root.verification_key,
        MockCircuits::verification_key(ProvingRequestType::RootRollup)
    );
    assert_eq!(
        tester.enqueued.count(ProvingRequestType::BlockMergeRollup),
        6
    );
    assert_eq!(tester.enqueued.count(ProvingRequestType::RootRollup), 1);

    let status = tester.broker.status_summary();
    assert_eq!(status.queued + status.in_progress, 0);

    tester.shutdown().await;
    Ok(())
}
