//! OS signal handling for graceful shutdown.
//!
//! **Unix:** `SIGINT`, `SIGTERM`, `SIGQUIT`. **Elsewhere:** Ctrl-C.

use crate::router::CloseHandle;

/// Wait for a termination signal.
///
/// Each call installs independent listeners.
///
/// # Errors
///
/// Returns the I/O error if a listener cannot be registered.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => tracing::info!(signal = "SIGINT", "Shutdown signal received"),
        _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "Shutdown signal received"),
        _ = sigquit.recv() => tracing::info!(signal = "SIGQUIT", "Shutdown signal received"),
    }
    Ok(())
}

/// Wait for a termination signal.
///
/// # Errors
///
/// Returns the I/O error if the listener cannot be registered.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(signal = "ctrl-c", "Shutdown signal received");
    Ok(())
}

/// Close the router when a termination signal arrives.
///
/// Meant to be spawned next to `run()`. If listeners cannot be installed the
/// error is logged and the router is left running.
pub async fn close_on_signal(handle: CloseHandle) {
    match shutdown_signal().await {
        Ok(()) => handle.close(),
        Err(error) => tracing::error!(error = %error, "Failed to install signal handlers"),
    }
}
