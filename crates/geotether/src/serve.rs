//! Server bootstrap and shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tetherconf::TetherConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::device::PyMobileDevice;
use crate::session::{SessionRegistry, SessionTimeouts};
use crate::web::{self, AppState};

/// Run the control surface with the `pymobiledevice3` backend until
/// SIGINT/SIGTERM.
pub async fn run(config: &TetherConfig) -> Result<()> {
    info!("📍 geotether starting");
    info!("   Device tool: {}", config.device.tool.display());
    info!(
        "   Ready timeout: {:?}, stop timeout: {:?}",
        config.sessions.ready_timeout(),
        config.sessions.stop_timeout()
    );

    let registry = Arc::new(SessionRegistry::new(SessionTimeouts::from(&config.sessions)));
    let state = AppState::with_backend(registry, PyMobileDevice::from_config(&config.device));

    let addr = config.infra.bind.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("📍 geotether ready on http://{}", addr);
    serve(listener, state, shutdown_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Serve `state` on `listener` until `shutdown` resolves, then stop every
/// session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    let rsd = Arc::clone(&state.rsd);

    axum::serve(listener, web::router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Stopping all device sessions...");
    tokio::task::spawn_blocking(move || registry.shutdown())
        .await
        .context("Session teardown panicked")?;
    rsd.clear();

    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
