use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Shape of the optional `--logging-config` JSON file.
#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub file: Option<std::path::PathBuf>,
}

pub fn parse_config(raw: &str) -> serde_json::Result<LoggingConfig> {
    serde_json::from_str(raw)
}

/// Install the global subscriber. `RUST_LOG` wins over the config file's
/// level so ad-hoc debugging never needs a config edit.
pub fn init(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read logging config {}", path.display()))?;
            parse_config(&raw)
                .with_context(|| format!("failed to parse logging config {}", path.display()))?
        }
        None => LoggingConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.level.as_deref().unwrap_or("info"))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}
