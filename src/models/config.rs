use crate::models::error::{BrowserError, Result};
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Delays above this many milliseconds per unit make a batch run for hours.
const LONG_DELAY_UNIT_MS: u64 = 60_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Length of one delay unit. A row drawing delay `n` waits `n * delay_unit_ms`.
    #[serde(default = "default_delay_unit_ms")]
    pub delay_unit_ms: u64,
    /// Cap on numbered copy names probed per duplicate. `None` probes forever.
    #[serde(default)]
    pub max_copy_attempts: Option<u64>,
    /// How often a duplicate is retried when another process takes the
    /// resolved name between the check and the copy.
    #[serde(default = "default_max_copy_races")]
    pub max_copy_races: u32,
    /// Fixed seed for delay draws. `None` seeds from the OS.
    #[serde(default)]
    pub delay_seed: Option<u64>,
    #[serde(default = "bool_true")]
    pub show_hidden: bool,
}

const fn default_delay_unit_ms() -> u64 {
    1000
}
const fn default_max_copy_races() -> u32 {
    16
}
const fn bool_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delay_unit_ms: default_delay_unit_ms(),
            max_copy_attempts: None,
            max_copy_races: default_max_copy_races(),
            delay_seed: None,
            show_hidden: bool_true(),
        }
    }
}

impl Config {
    pub fn delay_unit(&self) -> Duration {
        Duration::from_millis(self.delay_unit_ms)
    }
}

pub fn setup_config(config_file: String) -> Result<Config> {
    let config_path = PathBuf::from(config_file);
    info!("Loading config from: {}", config_path.display());

    let config_str = fs::read_to_string(&config_path).map_err(|cause| {
        BrowserError::ConfigRead {
            path: config_path.clone(),
            cause,
        }
    })?;

    let config: Config = serde_json::from_str(&config_str).map_err(|cause| {
        BrowserError::ConfigParse {
            path: config_path,
            cause,
        }
    })?;

    validate_config(&config)?;

    Ok(config)
}

/// Validates the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    info!("Validating configuration...");

    if config.delay_unit_ms == 0 {
        return Err(BrowserError::ConfigInvalid(
            "delay_unit_ms must be greater than 0".to_string(),
        ));
    }

    if config.delay_unit_ms > LONG_DELAY_UNIT_MS {
        warn!(
            "delay_unit_ms ({}) is longer than a minute. Processing large folders will take a long time.",
            config.delay_unit_ms
        );
    }

    if config.max_copy_attempts == Some(0) {
        return Err(BrowserError::ConfigInvalid(
            "max_copy_attempts of 0 allows no numbered copies. Set it to at least 1 or remove it."
                .to_string(),
        ));
    }

    if config.max_copy_races == 0 {
        return Err(BrowserError::ConfigInvalid(
            "max_copy_races must be greater than 0".to_string(),
        ));
    }

    info!("Configuration validation passed");
    Ok(())
}
