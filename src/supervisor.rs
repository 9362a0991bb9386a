//! Supervisor (C9): single-instance PID-file lock, signal handling, and the
//! top-level orderly-shutdown sequence: a broadcast channel fanned out to
//! the listeners and the probe loop, each given a bounded grace period to
//! wind down, plus an `flock`-held PID file that prevents a second instance
//! from starting against the same configuration.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::Core;
use crate::error::{ProxyError, Result};
use crate::{selector, server};

/// Holds an exclusive `flock` on the configured PID file for the process
/// lifetime. Dropping it releases the lock and removes the file, so a crash
/// (rather than a clean exit) leaves the lock held only as long as the OS
/// keeps the file descriptor open, which `flock` already accounts for.
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    /// Acquires the lock or fails immediately if another instance already
    /// holds it — this proxy never waits on a contended PID file.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ProxyError::Io)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(ProxyError::Io)?;

        file.try_lock_exclusive()
            .map_err(|_| ProxyError::LockError(format!("{} is held by another instance", path.display())))?;

        file.set_len(0).map_err(ProxyError::Io)?;
        let mut handle = &file;
        write!(handle, "{}", std::process::id()).map_err(ProxyError::Io)?;

        Ok(PidLock { path, file })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

/// Runs the proxy until a termination signal arrives, then drains in-flight
/// work before returning. The caller maps `Ok(())` to exit code 0 and any
/// `Err` to the appropriate non-zero code.
pub async fn run(core: Arc<Core>) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let udp_core = Arc::clone(&core);
    let udp_rx = shutdown_tx.subscribe();
    let udp_handle = tokio::spawn(async move { server::run_udp_listener(udp_core, udp_rx).await });

    let tcp_core = Arc::clone(&core);
    let tcp_rx = shutdown_tx.subscribe();
    let tcp_handle = tokio::spawn(async move { server::run_tcp_listener(tcp_core, tcp_rx).await });

    let probe_selector = Arc::clone(&core.selector);
    let probe_rx = shutdown_tx.subscribe();
    let probe_handle = tokio::spawn(selector::Selector::probe_loop(probe_selector, probe_rx));

    // Race the listeners against the termination signal so a bind failure at
    // startup is reported immediately instead of only surfacing at shutdown.
    let (mut udp_handle, mut tcp_handle) = (udp_handle, tcp_handle);
    tokio::select! {
        _ = wait_for_termination() => {
            info!("shutdown signal received, draining in-flight queries");
        }
        result = &mut udp_handle => {
            return Err(listener_exit_error("udp listener", result));
        }
        result = &mut tcp_handle => {
            return Err(listener_exit_error("tcp listener", result));
        }
    }

    let _ = shutdown_tx.send(());

    let drain = core.config.shutdown_drain_grace;
    for (name, handle) in [("udp listener", udp_handle), ("tcp listener", tcp_handle)] {
        match tokio::time::timeout(drain, handle).await {
            Ok(Ok(Ok(()))) => info!("{name} stopped"),
            Ok(Ok(Err(e))) => warn!("{name} stopped with an error: {e}"),
            Ok(Err(e)) => warn!("{name} task panicked: {e}"),
            Err(_) => warn!("{name} did not stop within the drain grace period"),
        }
    }
    let _ = tokio::time::timeout(drain, probe_handle).await;

    info!("shutdown complete");
    Ok(())
}

fn listener_exit_error(
    name: &str,
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> ProxyError {
    match result {
        Ok(Ok(())) => ProxyError::ConfigError(format!("{name} exited unexpectedly")),
        Ok(Err(e)) => ProxyError::Io(e),
        Err(e) => ProxyError::ConfigError(format!("{name} task panicked: {e}")),
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
