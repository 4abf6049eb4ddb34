//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, TetherConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/geotether/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("geotether/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("geotether.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and lay every key it sets over `config`.
///
/// Keys absent from the file keep whatever value `config` already holds,
/// so files can be applied one after another in precedence order.
pub fn apply_file(config: &mut TetherConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

fn apply_toml(config: &mut TetherConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let parse_error = |key: &str, expected: &str| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("{key}: expected {expected}"),
    };

    if let Some(bind) = table.get("bind").and_then(|v| v.as_table()) {
        if let Some(v) = bind.get("host") {
            config.infra.bind.host = v
                .as_str()
                .ok_or_else(|| parse_error("bind.host", "a string"))?
                .to_string();
        }
        if let Some(v) = bind.get("http_port") {
            config.infra.bind.http_port = v
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| parse_error("bind.http_port", "a port number"))?;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level") {
            config.infra.telemetry.log_level = v
                .as_str()
                .ok_or_else(|| parse_error("telemetry.log_level", "a string"))?
                .to_string();
        }
        if let Some(v) = telemetry.get("otlp_endpoint") {
            config.infra.telemetry.otlp_endpoint = v
                .as_str()
                .ok_or_else(|| parse_error("telemetry.otlp_endpoint", "a string"))?
                .to_string();
        }
    }

    if let Some(sessions) = table.get("sessions").and_then(|v| v.as_table()) {
        let seconds = |key: &str| -> Result<Option<u64>, ConfigError> {
            match sessions.get(key) {
                None => Ok(None),
                Some(v) => v
                    .as_integer()
                    .and_then(|n| u64::try_from(n).ok())
                    .map(Some)
                    .ok_or_else(|| parse_error(&format!("sessions.{key}"), "a non-negative integer")),
            }
        };

        if let Some(v) = seconds("ready_timeout_secs")? {
            config.sessions.ready_timeout_secs = v;
        }
        if let Some(v) = seconds("stop_timeout_secs")? {
            config.sessions.stop_timeout_secs = v;
        }
        if let Some(v) = seconds("teardown_grace_ms")? {
            config.sessions.teardown_grace_ms = v;
        }
    }

    if let Some(device) = table.get("device").and_then(|v| v.as_table()) {
        if let Some(v) = device.get("tool") {
            let tool = v
                .as_str()
                .ok_or_else(|| parse_error("device.tool", "a path string"))?;
            config.device.tool = expand_path(tool);
        }
        if let Some(v) = device.get("command_timeout_secs") {
            config.device.command_timeout_secs = v
                .as_integer()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| parse_error("device.command_timeout_secs", "a non-negative integer"))?;
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut TetherConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("GEOTETHER_HOST") {
        config.infra.bind.host = v;
        sources.env_overrides.push("GEOTETHER_HOST".to_string());
    }
    if let Ok(v) = env::var("GEOTETHER_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.bind.http_port = port;
            sources.env_overrides.push("GEOTETHER_HTTP_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("GEOTETHER_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("GEOTETHER_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
    if let Ok(v) = env::var("GEOTETHER_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("GEOTETHER_OTLP_ENDPOINT".to_string());
    }
    // Also support standard OTEL env var
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }

    if let Ok(v) = env::var("GEOTETHER_READY_TIMEOUT_SECS") {
        if let Ok(secs) = v.parse() {
            config.sessions.ready_timeout_secs = secs;
            sources.env_overrides.push("GEOTETHER_READY_TIMEOUT_SECS".to_string());
        }
    }
    if let Ok(v) = env::var("GEOTETHER_STOP_TIMEOUT_SECS") {
        if let Ok(secs) = v.parse() {
            config.sessions.stop_timeout_secs = secs;
            sources.env_overrides.push("GEOTETHER_STOP_TIMEOUT_SECS".to_string());
        }
    }

    if let Ok(v) = env::var("GEOTETHER_DEVICE_TOOL") {
        config.device.tool = expand_path(&v);
        sources.env_overrides.push("GEOTETHER_DEVICE_TOOL".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
