// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::net::SocketAddr;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StoreConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<StoreConfig> {
        let content = Self::substitute_env_vars(content);

        let config: StoreConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${NIDUS_DATA_DIR:-/var/lib/nidus} -> /var/lib/nidus (if NIDUS_DATA_DIR not set)
    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").expect("static regex is valid");

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    // Leave the placeholder if unset and no default
                    None => format!("${{{}}}", var_name),
                },
            }
        })
        .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &StoreConfig) -> Result<()> {
        for (name, addr) in [
            ("server.sensor_listen", &config.server.sensor_listen),
            ("server.query_listen", &config.server.query_listen),
        ] {
            if addr.parse::<SocketAddr>().is_err() {
                bail!("{} must be a socket address, got '{}'", name, addr);
            }
        }

        if config.server.max_line_bytes == 0 {
            bail!("server.max_line_bytes must be > 0");
        }

        match config.storage.backend.as_str() {
            "log" => {
                let Some(log) = config.storage.backend_config.as_log() else {
                    bail!("log backend selected but log config missing");
                };
                if log.data_dir.as_os_str().is_empty() {
                    bail!("storage.log.data_dir cannot be empty");
                }
                if log.compression.level > 4 {
                    bail!("storage.log.compression.level must be 0-4");
                }
            }
            "memory" => {
                if config.storage.backend_config.as_memory().is_none() {
                    bail!("memory backend selected but memory config missing");
                }
            }
            unknown => bail!("Unknown backend: '{}'. Supported: log, memory", unknown),
        }

        if config.ingest.max_payload_bytes == 0 {
            bail!("ingest.max_payload_bytes must be > 0");
        }

        if config.ingest.max_payload_bytes >= config.server.max_line_bytes {
            bail!("ingest.max_payload_bytes must be smaller than server.max_line_bytes");
        }

        if config.lifecycle.stop_attempts == 0 {
            bail!("lifecycle.stop_attempts must be > 0");
        }

        match config.logging.format.as_str() {
            "text" | "json" => {}
            other => bail!("logging.format must be 'text' or 'json', got '{}'", other),
        }

        Ok(())
    }
}
