//! Simulation configuration loading from a TOML file.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use trackcast_core::PublisherConfig;

/// Top-level simulation configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimFileConfig {
    /// Publisher under test.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Run settings; command line flags take precedence.
    #[serde(default)]
    pub sim: SimSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimSettings {
    /// Master seed.
    pub seed: Option<u64>,

    /// Virtual duration of each scenario, in seconds.
    pub duration_secs: Option<f64>,
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads the configuration file, or defaults when no path is given.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> Result<SimFileConfig, ConfigError> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let config = parse_config(&contents)?;
            tracing::info!(path = %path.display(), "Loaded simulation config");
            Ok(config)
        }
        None => Ok(SimFileConfig::default()),
    }
}

pub fn parse_config(contents: &str) -> Result<SimFileConfig, ConfigError> {
    Ok(toml::from_str(contents)?)
}
