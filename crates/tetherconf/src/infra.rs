//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Network bind address for the HTTP control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// Interface to listen on.
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// HTTP port for the control API.
    /// Default: 8000
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        8000
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or a full EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint for OpenTelemetry. Empty disables export.
    /// Default: ""
    #[serde(default)]
    pub otlp_endpoint: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Returns the OTLP endpoint if export is enabled.
    pub fn otlp(&self) -> Option<&str> {
        let endpoint = self.otlp_endpoint.trim();
        (!endpoint.is_empty()).then_some(endpoint)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: String::new(),
        }
    }
}

/// How the device tooling is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path or name of the `pymobiledevice3` executable.
    /// Default: pymobiledevice3
    #[serde(default = "DeviceConfig::default_tool")]
    pub tool: PathBuf,

    /// Upper bound for one-shot device queries (list, developer mode).
    /// Default: 20
    #[serde(default = "DeviceConfig::default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl DeviceConfig {
    fn default_tool() -> PathBuf {
        PathBuf::from("pymobiledevice3")
    }

    fn default_command_timeout_secs() -> u64 {
        20
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tool: Self::default_tool(),
            command_timeout_secs: Self::default_command_timeout_secs(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
