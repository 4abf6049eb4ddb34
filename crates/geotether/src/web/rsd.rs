//! Last-known RSD endpoints per device.
//!
//! Entries are written when a tunnel becomes ready and removed on an
//! explicit disconnect. A tunnel that dies on its own leaves its entry in
//! place; `GET /rsd/{udid}` cross-checks the registry for liveness.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;

use crate::device::RsdEndpoint;

/// Connection type recorded for tunnel endpoints.
pub const WIFI: &str = "Wifi";

/// An endpoint as reported over HTTP. The port is a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RsdRecord {
    pub host: String,
    pub port: String,
}

impl From<&RsdEndpoint> for RsdRecord {
    fn from(endpoint: &RsdEndpoint) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RsdBook {
    entries: DashMap<String, BTreeMap<String, RsdEndpoint>>,
}

impl RsdBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, udid: &str, endpoint: RsdEndpoint) {
        self.entries
            .entry(udid.to_string())
            .or_default()
            .insert(WIFI.to_string(), endpoint);
    }

    pub fn get(&self, udid: &str) -> Option<RsdEndpoint> {
        self.entries
            .get(udid)
            .and_then(|by_conn| by_conn.get(WIFI).cloned())
    }

    pub fn forget(&self, udid: &str) {
        self.entries.remove(udid);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// udid -> connection type -> endpoint.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, RsdRecord>> {
        self.entries
            .iter()
            .map(|entry| {
                let by_conn = entry
                    .value()
                    .iter()
                    .map(|(conn, endpoint)| (conn.clone(), RsdRecord::from(endpoint)))
                    .collect();
                (entry.key().clone(), by_conn)
            })
            .collect()
    }
}
