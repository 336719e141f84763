//! Log subscriber setup for the binary.
//!
//! `RUST_LOG` directives win over the level passed in, so a single module
//! can be turned up without touching the rest.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(IngestError::InvalidConfig(format!("invalid log format: {other}"))),
        }
    }
}

pub fn parse_level(s: &str) -> IngestResult<Level> {
    Level::from_str(s).map_err(|_| IngestError::InvalidConfig(format!("invalid log level: {s}")))
}

pub fn init_logging(level: Level, format: LogFormat) -> IngestResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init(),
    };
    result.map_err(|e| IngestError::Bootstrap(format!("logging setup failed: {e}")))
}
