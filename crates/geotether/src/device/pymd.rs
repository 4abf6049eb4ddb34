//! `pymobiledevice3` command line backend.
//!
//! One-shot queries run with a bounded timeout. Tunnels and location holds
//! keep their child process alive for as long as the owning session runs;
//! every child is spawned with `kill_on_drop` so an abandoned session never
//! leaves a process behind.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Coordinate, DeviceDirectory, DeviceEntry, DeviceError, LocationHold, LocationRuntime,
    RsdEndpoint, Tunnel, TunnelRuntime,
};

/// How long a `simulate-location set` child must survive before the
/// location counts as applied.
const APPLY_SETTLE: Duration = Duration::from_secs(1);

/// Bound on waiting for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Trailing stderr lines kept for classifying a failure.
const STDERR_TAIL: usize = 50;

/// Drives the `pymobiledevice3` CLI.
#[derive(Debug, Clone)]
pub struct PyMobileDevice {
    tool: PathBuf,
    command_timeout: Duration,
}

impl PyMobileDevice {
    pub fn new(tool: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            command_timeout,
        }
    }

    pub fn from_config(config: &tetherconf::DeviceConfig) -> Self {
        Self::new(config.tool.clone(), config.command_timeout())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a one-shot command and return its stdout.
    async fn run(&self, args: &[&str], udid: Option<&str>) -> Result<String, DeviceError> {
        debug!(tool = %self.tool.display(), ?args, "Running device tool");

        let output = tokio::time::timeout(self.command_timeout, self.command(args).output())
            .await
            .map_err(|_| {
                DeviceError::Transport(format!(
                    "`{}` did not answer within {:?}",
                    args.join(" "),
                    self.command_timeout
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, udid));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Map a failed invocation's stderr onto the error taxonomy.
fn classify_failure(stderr: &str, udid: Option<&str>) -> DeviceError {
    let lowered = stderr.to_lowercase();
    let last_line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string();

    if lowered.contains("connectionabortederror")
        || lowered.contains("connection aborted")
        || lowered.contains("connectionterminatederror")
        || lowered.contains("connection reset")
    {
        return DeviceError::Transport(last_line);
    }

    if let Some(udid) = udid {
        if lowered.contains("devicenotfounderror") || lowered.contains("device not found") {
            return DeviceError::NotFound(udid.to_string());
        }
    }

    DeviceError::Backend(last_line)
}

/// Parse `usbmux list` JSON into directory entries.
///
/// Network-attached devices are reported as `Wifi`, and every entry is
/// tagged with `wifiState: true` for the frontend.
fn parse_usbmux_list(stdout: &str) -> Result<Vec<DeviceEntry>, DeviceError> {
    let devices: Vec<Value> = serde_json::from_str(stdout.trim())
        .map_err(|e| DeviceError::Parse(format!("usbmux list: {e}")))?;

    devices
        .into_iter()
        .map(|mut info| {
            let udid = ["Identifier", "UniqueDeviceID", "SerialNumber"]
                .iter()
                .find_map(|k| info.get(*k).and_then(Value::as_str))
                .map(str::to_string)
                .ok_or_else(|| DeviceError::Parse("usbmux entry without an identifier".into()))?;

            let connection_type = match info.get("ConnectionType").and_then(Value::as_str) {
                Some("Network") => "Wifi".to_string(),
                Some(other) => other.to_string(),
                None => "USB".to_string(),
            };

            if let Some(obj) = info.as_object_mut() {
                obj.insert("wifiState".to_string(), Value::Bool(true));
            }

            Ok(DeviceEntry {
                udid,
                connection_type,
                info,
            })
        })
        .collect()
}

/// Parse a `--script-mode` tunnel line: `<host> <port>`.
fn parse_tunnel_line(line: &str) -> Option<RsdEndpoint> {
    let mut parts = line.split_whitespace();
    let host = parts.next()?;
    let port = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(RsdEndpoint::new(host, port))
}

fn parse_bool(stdout: &str) -> Result<bool, DeviceError> {
    match stdout.trim().to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(DeviceError::Parse(format!(
            "expected true or false, got {other:?}"
        ))),
    }
}

/// Read a child's pipe until it closes, logging each line and keeping the
/// last few. Long-lived children block once a pipe nobody reads fills up.
fn drain<R>(pipe: R, what: &'static str) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    debug!(line = %line, "{what} output");
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    debug!(error = %e, "Stopped reading {what} output");
                    break;
                }
            }
        }
        Vec::from(tail).join("\n")
    })
}

fn drain_stderr(child: &mut Child, what: &'static str) -> Option<JoinHandle<String>> {
    child.stderr.take().map(|pipe| drain(pipe, what))
}

/// Collect what a drain saw once its child has exited.
async fn stderr_tail(drained: Option<JoinHandle<String>>, what: &str) -> String {
    let Some(handle) = drained else {
        return String::new();
    };
    match tokio::time::timeout(REAP_TIMEOUT, handle).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            debug!(error = %e, "{what} stderr reader failed");
            String::new()
        }
        Err(_) => {
            debug!("{what} stderr still open after exit");
            String::new()
        }
    }
}

async fn reap(child: &mut Child, what: &str) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "{what} already exited");
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "{what} exited"),
        Ok(Err(e)) => warn!(error = %e, "Failed to reap {what}"),
        Err(_) => warn!("{what} did not exit within {REAP_TIMEOUT:?}"),
    }
}

#[async_trait]
impl DeviceDirectory for PyMobileDevice {
    async fn list(&self) -> Result<Vec<DeviceEntry>, DeviceError> {
        let stdout = self.run(&["usbmux", "list"], None).await?;
        parse_usbmux_list(&stdout)
    }

    async fn developer_mode_status(&self, udid: &str) -> Result<bool, DeviceError> {
        let stdout = self
            .run(&["amfi", "developer-mode-status", "--udid", udid], Some(udid))
            .await?;
        parse_bool(&stdout)
    }

    async fn enable_developer_mode(&self, udid: &str) -> Result<(), DeviceError> {
        self.run(&["amfi", "enable-developer-mode", "--udid", udid], Some(udid))
            .await?;
        info!(udid, "Developer mode enabled");
        Ok(())
    }
}

/// A `lockdown start-tunnel` child and the endpoint it reported.
struct CliTunnel {
    child: Child,
    endpoint: RsdEndpoint,
}

#[async_trait]
impl Tunnel for CliTunnel {
    fn endpoint(&self) -> &RsdEndpoint {
        &self.endpoint
    }

    async fn close(&mut self) {
        reap(&mut self.child, "tunnel").await;
    }
}

#[async_trait]
impl TunnelRuntime for PyMobileDevice {
    async fn start_tunnel(&self, udid: &str) -> Result<Box<dyn Tunnel>, DeviceError> {
        let mut child = self
            .command(&["lockdown", "start-tunnel", "--udid", udid, "--script-mode"])
            .spawn()?;
        let stderr = drain_stderr(&mut child, "tunnel");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Backend("tunnel stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if let Some(endpoint) = parse_tunnel_line(&line) {
                info!(udid, %endpoint, "Tunnel established");
                drain(lines.into_inner(), "tunnel");
                return Ok(Box::new(CliTunnel { child, endpoint }));
            }
            debug!(udid, line = %line, "Tunnel output");
        }

        match child.wait().await {
            Ok(status) => debug!(udid, %status, "Tunnel exited before reporting an endpoint"),
            Err(e) => debug!(udid, error = %e, "Failed to wait on tunnel"),
        }
        let stderr = stderr_tail(stderr, "tunnel").await;
        Err(classify_failure(&stderr, Some(udid)))
    }
}

/// A running `simulate-location set` child.
struct CliLocationHold {
    tool: PyMobileDevice,
    endpoint: RsdEndpoint,
    child: Option<Child>,
}

#[async_trait]
impl LocationHold for CliLocationHold {
    async fn clear(&mut self) {
        if let Some(mut child) = self.child.take() {
            reap(&mut child, "location simulation").await;
        }

        let port = self.endpoint.port.to_string();
        let args = [
            "developer",
            "dvt",
            "simulate-location",
            "clear",
            "--rsd",
            self.endpoint.host.as_str(),
            port.as_str(),
        ];
        match self.tool.run(&args, None).await {
            Ok(_) => debug!(endpoint = %self.endpoint, "Simulated location cleared"),
            Err(e) => warn!(endpoint = %self.endpoint, error = %e, "Failed to clear simulated location"),
        }
    }
}

#[async_trait]
impl LocationRuntime for PyMobileDevice {
    async fn apply_location(
        &self,
        endpoint: &RsdEndpoint,
        coordinate: Coordinate,
    ) -> Result<Box<dyn LocationHold>, DeviceError> {
        coordinate.validate()?;

        let port = endpoint.port.to_string();
        let lat = coordinate.lat.to_string();
        let lon = coordinate.lon.to_string();
        let mut child = self
            .command(&[
                "developer",
                "dvt",
                "simulate-location",
                "set",
                "--rsd",
                endpoint.host.as_str(),
                port.as_str(),
                "--",
                lat.as_str(),
                lon.as_str(),
            ])
            .spawn()?;
        if let Some(stdout) = child.stdout.take() {
            drain(stdout, "location simulation");
        }
        let stderr = drain_stderr(&mut child, "location simulation");

        // Newer tool versions hold the simulation open until interrupted,
        // older ones exit as soon as it is written.
        let settled = tokio::time::timeout(APPLY_SETTLE, child.wait()).await;
        let child = match settled {
            Err(_) => Some(child),
            Ok(Ok(status)) if status.success() => None,
            Ok(Ok(_)) => {
                let stderr = stderr_tail(stderr, "location simulation").await;
                return Err(classify_failure(&stderr, None));
            }
            Ok(Err(e)) => return Err(DeviceError::Io(e)),
        };

        info!(%endpoint, lat = coordinate.lat, lon = coordinate.lon, "Simulated location applied");
        Ok(Box::new(CliLocationHold {
            tool: self.clone(),
            endpoint: endpoint.clone(),
            child,
        }))
    }
}
