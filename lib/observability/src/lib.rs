//! Logging and metrics setup shared by the binaries.

mod logs;
mod prometheus;

pub use logs::{LogConfig, LogFormat};
pub use prometheus::PrometheusConfig;
