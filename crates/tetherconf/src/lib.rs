//! Minimal configuration loading for geotether.
//!
//! Configuration is split into three sections:
//!
//! - **Infrastructure** (`InfraConfig`): bind address and telemetry. Fixed
//!   for the lifetime of the process.
//! - **Sessions** (`SessionsConfig`): the bounded waits that govern device
//!   session startup and teardown.
//! - **Device** (`DeviceConfig`): how the device tooling is invoked.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tetherconf::TetherConfig;
//!
//! let config = TetherConfig::load().expect("Failed to load config");
//! println!("HTTP port: {}", config.infra.bind.http_port);
//! println!("Ready timeout: {:?}", config.sessions.ready_timeout());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/geotether/config.toml` (system)
//! 2. `~/.config/geotether/config.toml` (user)
//! 3. `./geotether.toml` (local override, or the `--config` path)
//! 4. Environment variables (`GEOTETHER_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! host = "0.0.0.0"
//! http_port = 8000
//!
//! [telemetry]
//! log_level = "info"
//! otlp_endpoint = ""
//!
//! [sessions]
//! ready_timeout_secs = 30
//! stop_timeout_secs = 5
//!
//! [device]
//! tool = "pymobiledevice3"
//! ```

pub mod infra;
pub mod loader;
pub mod sessions;

pub use infra::{BindConfig, DeviceConfig, InfraConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sessions::SessionsConfig;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete geotether configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TetherConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

impl TetherConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit file, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./geotether.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = TetherConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::apply_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# geotether configuration\n\n");

        output.push_str("[bind]\n");
        output.push_str(&format!("host = \"{}\"\n", self.infra.bind.host));
        output.push_str(&format!("http_port = {}\n", self.infra.bind.http_port));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));
        output.push_str(&format!(
            "otlp_endpoint = \"{}\"\n",
            self.infra.telemetry.otlp_endpoint
        ));

        output.push_str("\n[sessions]\n");
        output.push_str(&format!(
            "ready_timeout_secs = {}\n",
            self.sessions.ready_timeout_secs
        ));
        output.push_str(&format!(
            "stop_timeout_secs = {}\n",
            self.sessions.stop_timeout_secs
        ));
        output.push_str(&format!(
            "teardown_grace_ms = {}\n",
            self.sessions.teardown_grace_ms
        ));

        output.push_str("\n[device]\n");
        output.push_str(&format!("tool = \"{}\"\n", self.device.tool.display()));
        output.push_str(&format!(
            "command_timeout_secs = {}\n",
            self.device.command_timeout_secs
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert_eq!(config.infra.bind.http_port, 8000);
        assert_eq!(config.sessions.ready_timeout_secs, 30);
        assert_eq!(config.sessions.stop_timeout_secs, 5);
    }

    #[test]
    fn test_to_toml_is_loadable() {
        let mut config = TetherConfig::default();
        config.infra.bind.http_port = 9100;
        config.sessions.stop_timeout_secs = 2;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geotether.toml");
        std::fs::write(&path, config.to_toml()).unwrap();

        let mut reloaded = TetherConfig::default();
        loader::apply_file(&mut reloaded, &path).unwrap();
        assert_eq!(reloaded.infra.bind.http_port, 9100);
        assert_eq!(reloaded.sessions.stop_timeout_secs, 2);
        assert_eq!(reloaded.device.tool, config.device.tool);
    }

    #[test]
    fn test_load_with_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[bind]\nhttp_port = 9321\n").unwrap();

        let (config, sources) = TetherConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        // Env may override the port on a developer machine; only check the file was used.
        if !sources.env_overrides.iter().any(|v| v == "GEOTETHER_HTTP_PORT") {
            assert_eq!(config.infra.bind.http_port, 9321);
        }
    }
}
