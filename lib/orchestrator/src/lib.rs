//! Proof dependency tree: drives a binary tree of aggregation circuits to a single root proof.
//!
//! Leaves are fed in from outside in any order. Each [`CircuitNode`] proves itself once both of
//! its children are proven, through any [`Prover`](epoch_prover_types::Prover); in production
//! that is the [`BrokerProverFacade`], which turns every proof into a proving job on the broker.

mod config;
mod facade;
mod metrics;
mod node;
mod slot;
mod tree;

pub use config::{FacadeConfig, OrchestratorConfig};
pub use facade::BrokerProverFacade;
pub use node::{CircuitNode, ProvingDeps};
pub use slot::SharedResult;
pub use tree::{LeafResult, ProofTree, TreeKind, prove_padding_leaf};

#[cfg(test)]
mod tests;
