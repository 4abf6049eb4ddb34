//! geotether - device session manager.
//!
//! Keeps Wi-Fi tunnels and simulated GPS locations running for attached
//! mobile devices, one isolated worker per session, behind a small HTTP API.

pub mod device;
pub mod serve;
pub mod session;
pub mod telemetry;
pub mod web;
