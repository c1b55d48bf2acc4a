// Configuration module for nidus-store
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StoreConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<StoreConfig> {
    let mut config = load_config(path)?;

    // Allow environment variables to override config values
    if let Ok(data_dir) = std::env::var("NIDUS_DATA_DIR") {
        if let Some(log_config) = config.storage.backend_config.as_log_mut() {
            log_config.data_dir = PathBuf::from(data_dir);
        }
    }

    if let Ok(addr) = std::env::var("NIDUS_SENSOR_LISTEN") {
        config.server.sensor_listen = addr;
    }

    if let Ok(addr) = std::env::var("NIDUS_QUERY_LISTEN") {
        config.server.query_listen = addr;
    }

    ConfigLoader::validate(&config).context("Invalid configuration after environment overrides")?;

    Ok(config)
}
