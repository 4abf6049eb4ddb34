//! Device collaborators.
//!
//! Everything that actually talks to a phone lives behind the traits in this
//! module. The session core only ever sees [`TunnelRuntime`] and
//! [`LocationRuntime`]; the control surface also queries a
//! [`DeviceDirectory`]. [`PyMobileDevice`] implements all three by driving
//! the `pymobiledevice3` command line tool.

pub mod pymd;

pub use pymd::PyMobileDevice;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors from device collaborators.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device {0} not found")]
    NotFound(String),

    /// The device connection was aborted or could not be reached.
    #[error("Connection aborted: {0}")]
    Transport(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Device tool failed: {0}")]
    Backend(String),

    #[error("Unexpected device tool output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address of a device's Remote Service Discovery endpoint, reachable once a
/// tunnel is up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RsdEndpoint {
    pub host: String,
    pub port: u16,
}

impl RsdEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RsdEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.port)
    }
}

/// A GPS position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Reject positions no device would accept.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if !self.lat.is_finite() || !self.lon.is_finite() {
            return Err(DeviceError::InvalidInput(
                "coordinate must be finite".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(DeviceError::InvalidInput(format!(
                "latitude {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(DeviceError::InvalidInput(format!(
                "longitude {} out of range [-180, 180]",
                self.lon
            )));
        }
        Ok(())
    }
}

/// One device as seen over one connection type.
///
/// A phone plugged in by cable and also paired over the network shows up
/// twice, once per connection type.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub udid: String,
    /// `USB` or `Wifi`.
    pub connection_type: String,
    pub info: Value,
}

/// udid -> connection type -> device info objects.
pub type DeviceListing = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

/// Group a flat device list the way `GET /devices` reports it.
pub fn group_devices(entries: Vec<DeviceEntry>) -> DeviceListing {
    let mut listing = DeviceListing::new();
    for entry in entries {
        listing
            .entry(entry.udid)
            .or_default()
            .entry(entry.connection_type)
            .or_default()
            .push(entry.info);
    }
    listing
}

/// Enumerates devices and answers point queries about them.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<DeviceEntry>, DeviceError>;

    /// Entries for a single device, one per connection type.
    async fn info(&self, udid: &str) -> Result<Vec<DeviceEntry>, DeviceError> {
        let entries: Vec<DeviceEntry> = self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.udid == udid)
            .collect();

        if entries.is_empty() {
            return Err(DeviceError::NotFound(udid.to_string()));
        }
        Ok(entries)
    }

    async fn developer_mode_status(&self, udid: &str) -> Result<bool, DeviceError>;

    async fn enable_developer_mode(&self, udid: &str) -> Result<(), DeviceError>;
}

/// A live tunnel to one device.
#[async_trait]
pub trait Tunnel: Send {
    fn endpoint(&self) -> &RsdEndpoint;

    /// Tear the tunnel down. Failures are logged, not returned.
    async fn close(&mut self);
}

/// Establishes tunnels.
#[async_trait]
pub trait TunnelRuntime: Send + Sync {
    /// Resolves once the tunnel is live. Dropping the future abandons the
    /// attempt.
    async fn start_tunnel(&self, udid: &str) -> Result<Box<dyn Tunnel>, DeviceError>;
}

/// A simulated location that stays in effect until cleared.
#[async_trait]
pub trait LocationHold: Send {
    async fn clear(&mut self);
}

/// Applies simulated locations through a tunnel's RSD endpoint.
#[async_trait]
pub trait LocationRuntime: Send + Sync {
    async fn apply_location(
        &self,
        endpoint: &RsdEndpoint,
        coordinate: Coordinate,
    ) -> Result<Box<dyn LocationHold>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate { lat: 37.33, lon: -122.03 }.validate().is_ok());
        assert!(Coordinate { lat: 90.0, lon: 180.0 }.validate().is_ok());

        let err = Coordinate { lat: 91.0, lon: 0.0 }.validate().unwrap_err();
        assert!(matches!(err, DeviceError::InvalidInput(_)));
        assert!(err.to_string().contains("latitude"));

        assert!(Coordinate { lat: 0.0, lon: -180.5 }.validate().is_err());
        assert!(Coordinate { lat: f64::NAN, lon: 0.0 }.validate().is_err());
    }

    #[test]
    fn test_group_devices_by_udid_and_connection() {
        let listing = group_devices(vec![
            DeviceEntry {
                udid: "A".into(),
                connection_type: "USB".into(),
                info: json!({"DeviceName": "phone"}),
            },
            DeviceEntry {
                udid: "A".into(),
                connection_type: "Wifi".into(),
                info: json!({"DeviceName": "phone"}),
            },
            DeviceEntry {
                udid: "B".into(),
                connection_type: "USB".into(),
                info: json!({"DeviceName": "tablet"}),
            },
        ]);

        assert_eq!(listing.len(), 2);
        assert_eq!(listing["A"].len(), 2);
        assert_eq!(listing["A"]["Wifi"].len(), 1);
        assert_eq!(listing["B"]["USB"][0]["DeviceName"], "tablet");
    }

    struct FixedDirectory(Vec<DeviceEntry>);

    #[async_trait]
    impl DeviceDirectory for FixedDirectory {
        async fn list(&self) -> Result<Vec<DeviceEntry>, DeviceError> {
            Ok(self.0.clone())
        }

        async fn developer_mode_status(&self, _udid: &str) -> Result<bool, DeviceError> {
            Ok(false)
        }

        async fn enable_developer_mode(&self, _udid: &str) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_info_filters_and_reports_missing() {
        let directory = FixedDirectory(vec![DeviceEntry {
            udid: "A".into(),
            connection_type: "USB".into(),
            info: json!({}),
        }]);

        assert_eq!(directory.info("A").await.unwrap().len(), 1);
        let err = directory.info("Z").await.unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(ref id) if id == "Z"));
    }
}
