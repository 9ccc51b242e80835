//! Configuration loading with environment variable support
//!
//! Precedence: defaults, then the TOML file, then `HOUSE_*` variables.

use crate::config::HouseConfig;
use crate::errors::{HouseError, HouseResult};
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> HouseResult<HouseConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            Self::load_from_file(path)?
        } else {
            HouseConfig::default()
        };

        apply_overrides(&mut config, |key| env::var(key).ok())?;

        config
            .validate()
            .map_err(|e| HouseError::Config(e.to_string()))?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> HouseResult<HouseConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HouseError::Config(format!("Failed to read {}: {}", path, e)))?;

        parse_toml(&content)
    }
}

/// Parse a TOML document into a configuration; missing sections keep defaults
pub fn parse_toml(content: &str) -> HouseResult<HouseConfig> {
    toml::from_str(content).map_err(|e| HouseError::Config(format!("Failed to parse TOML: {}", e)))
}

fn parse_var<T: FromStr>(key: &str, value: String) -> HouseResult<T> {
    value
        .parse()
        .map_err(|_| HouseError::Config(format!("Invalid value for {}: '{}'", key, value)))
}

/// Apply `HOUSE_*` overrides using `lookup` as the variable source
pub fn apply_overrides<F>(config: &mut HouseConfig, lookup: F) -> HouseResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("HOUSE_API_HOST") {
        config.api.host = v;
    }
    if let Some(v) = lookup("HOUSE_API_PORT") {
        config.api.port = parse_var("HOUSE_API_PORT", v)?;
    }
    if let Some(v) = lookup("HOUSE_HMAC_SECRET") {
        config.engine.hmac_secret = v;
    }
    if let Some(v) = lookup("HOUSE_INSTANCE_ID") {
        config.maintenance.instance_id = v;
    }
    if let Some(v) = lookup("HOUSE_SESSION_TTL_SECS") {
        config.session.session_ttl_secs = parse_var("HOUSE_SESSION_TTL_SECS", v)?;
    }
    if let Some(v) = lookup("HOUSE_RECOVERY_WINDOW_SECS") {
        config.connection.recovery_window_secs = parse_var("HOUSE_RECOVERY_WINDOW_SECS", v)?;
    }
    if let Some(v) = lookup("HOUSE_ORACLE_TIMEOUT_MS") {
        config.engine.oracle_timeout_ms = parse_var("HOUSE_ORACLE_TIMEOUT_MS", v)?;
    }

    Ok(())
}
