use anyhow::Context as _;
use smart_config::{DescribeConfig, DeserializeConfig};
use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
    Logfmt,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            "logfmt" => Ok(Self::Logfmt),
            other => anyhow::bail!("unknown log format `{other}`, expected plain, json or logfmt"),
        }
    }
}

#[derive(Clone, Debug, DescribeConfig, DeserializeConfig)]
#[config(derive(Default))]
pub struct LogConfig {
    /// `plain`, `json` or `logfmt`.
    #[config(default_t = "plain".into())]
    pub format: String,
    /// Filter directives; `RUST_LOG` takes precedence when set.
    #[config(default_t = "info".into())]
    pub filter: String,
}

impl LogConfig {
    /// Installs the global tracing subscriber.
    pub fn init(&self) -> anyhow::Result<()> {
        let format: LogFormat = self.format.parse()?;
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.filter)
                .with_context(|| format!("invalid log filter `{}`", self.filter))?,
        };
        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().flatten_event(true))
                .try_init(),
            LogFormat::Logfmt => registry.with(tracing_logfmt::layer()).try_init(),
        }
        .context("failed to install tracing subscriber")
    }
}
