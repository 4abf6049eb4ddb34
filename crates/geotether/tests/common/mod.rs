//! Shared test harness: stub device collaborators and an in-process server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::oneshot;

use geotether::device::{
    Coordinate, DeviceDirectory, DeviceEntry, DeviceError, LocationHold, LocationRuntime,
    RsdEndpoint, Tunnel, TunnelRuntime,
};
use geotether::session::{SessionRegistry, SessionTimeouts};
use geotether::web::AppState;

/// How the stub directory answers `list`.
#[derive(Clone)]
pub enum DirectoryMode {
    Devices(Vec<DeviceEntry>),
    Aborted,
    Broken,
}

pub struct StubDirectory {
    pub mode: DirectoryMode,
}

impl StubDirectory {
    pub fn with_phone(udid: &str) -> Self {
        Self {
            mode: DirectoryMode::Devices(vec![
                DeviceEntry {
                    udid: udid.to_string(),
                    connection_type: "USB".to_string(),
                    info: json!({"DeviceName": "test phone", "wifiState": true}),
                },
                DeviceEntry {
                    udid: udid.to_string(),
                    connection_type: "Wifi".to_string(),
                    info: json!({"DeviceName": "test phone", "wifiState": true}),
                },
            ]),
        }
    }
}

#[async_trait]
impl DeviceDirectory for StubDirectory {
    async fn list(&self) -> Result<Vec<DeviceEntry>, DeviceError> {
        match &self.mode {
            DirectoryMode::Devices(devices) => Ok(devices.clone()),
            DirectoryMode::Aborted => Err(DeviceError::Transport(
                "[Errno 53] Software caused connection abort".to_string(),
            )),
            DirectoryMode::Broken => Err(DeviceError::Backend("usbmuxd not running".to_string())),
        }
    }

    async fn developer_mode_status(&self, udid: &str) -> Result<bool, DeviceError> {
        self.info(udid).await?;
        Ok(true)
    }

    async fn enable_developer_mode(&self, udid: &str) -> Result<(), DeviceError> {
        self.info(udid).await?;
        Ok(())
    }
}

/// Counters shared between a stub runtime and the test.
#[derive(Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub applied: Mutex<Vec<Coordinate>>,
    pub cleared: AtomicUsize,
}

impl Counters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<Coordinate> {
        self.applied.lock().unwrap().clone()
    }
}

struct StubTunnel {
    endpoint: RsdEndpoint,
    counters: Arc<Counters>,
}

#[async_trait]
impl Tunnel for StubTunnel {
    fn endpoint(&self) -> &RsdEndpoint {
        &self.endpoint
    }

    async fn close(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Brings a tunnel up after `delay`, or never while `ready` is false.
pub struct StubTunnels {
    pub endpoint: RsdEndpoint,
    pub delay: Duration,
    pub ready: Arc<AtomicBool>,
    pub counters: Arc<Counters>,
}

impl StubTunnels {
    pub fn ready_at(host: &str, port: u16, counters: &Arc<Counters>) -> Self {
        Self {
            endpoint: RsdEndpoint::new(host, port),
            delay: Duration::from_millis(100),
            ready: Arc::new(AtomicBool::new(true)),
            counters: Arc::clone(counters),
        }
    }

    pub fn never_ready(counters: &Arc<Counters>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            ..Self::ready_at("10.0.0.1", 1234, counters)
        }
    }
}

#[async_trait]
impl TunnelRuntime for StubTunnels {
    async fn start_tunnel(&self, _udid: &str) -> Result<Box<dyn Tunnel>, DeviceError> {
        if !self.ready.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubTunnel {
            endpoint: self.endpoint.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct StubHold {
    counters: Arc<Counters>,
}

#[async_trait]
impl LocationHold for StubHold {
    async fn clear(&mut self) {
        self.counters.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct StubLocations {
    pub counters: Arc<Counters>,
}

#[async_trait]
impl LocationRuntime for StubLocations {
    async fn apply_location(
        &self,
        _endpoint: &RsdEndpoint,
        coordinate: Coordinate,
    ) -> Result<Box<dyn LocationHold>, DeviceError> {
        self.counters.applied.lock().unwrap().push(coordinate);
        Ok(Box::new(StubHold {
            counters: Arc::clone(&self.counters),
        }))
    }
}

pub fn test_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        ready: Duration::from_secs(2),
        stop: Duration::from_secs(1),
        teardown_grace: Duration::from_millis(50),
    }
}

pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self.client.get(self.url(path)).send().await?)
    }

    pub async fn post(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self.client.post(self.url(path)).send().await?)
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        Ok(self.client.post(self.url(path)).json(body).send().await?)
    }

    /// Trigger graceful shutdown and wait for session teardown to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }
}

/// Spawn a server on an ephemeral port backed by the given collaborators.
pub async fn spawn_server(
    devices: StubDirectory,
    tunnels: StubTunnels,
    locations: StubLocations,
    timeouts: SessionTimeouts,
) -> Result<TestServer> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let state = AppState::new(
        Arc::new(SessionRegistry::new(timeouts)),
        Arc::new(devices),
        Arc::new(tunnels),
        Arc::new(locations),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(geotether::serve::serve(listener, state.clone(), async move {
        let _ = shutdown_rx.await;
    }));

    Ok(TestServer {
        base_url: format!("http://127.0.0.1:{}", port),
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?,
        state,
        shutdown_tx: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Server with a reachable phone `ABC` whose tunnel comes up at 10.0.0.1:1234.
pub async fn spawn_default_server(counters: &Arc<Counters>) -> Result<TestServer> {
    spawn_server(
        StubDirectory::with_phone("ABC"),
        StubTunnels::ready_at("10.0.0.1", 1234, counters),
        StubLocations {
            counters: Arc::clone(counters),
        },
        test_timeouts(),
    )
    .await
}
