//! JSON-over-HTTP transport for the broker, served under `/proving-jobs/v1`.
//!
//! The server exposes an in-process [`ProvingBroker`](crate::ProvingBroker); the client
//! implements the same producer/consumer traits so remote agents and producers are
//! interchangeable with local ones.

mod client;
mod models;
mod server;

pub use client::ProvingBrokerClient;
pub use server::{router, run, serve};

pub(crate) const API_PREFIX: &str = "/proving-jobs/v1";
