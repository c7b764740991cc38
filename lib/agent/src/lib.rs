//! Proving agent: pulls jobs from a broker, proves them and reports the outcome.

mod agent;
mod config;
mod metrics;

pub use agent::ProvingAgent;
pub use config::AgentConfig;
