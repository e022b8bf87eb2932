//! Shutdown signalling.
//!
//! `ShutdownHandle` is the sending side (the signal listener, or a test);
//! `ShutdownSignal` is what the worker loop watches. Triggering is one-way
//! and idempotent.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Cancel-safe.
    ///
    /// If every handle is dropped without triggering, this never resolves.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Trigger `handle` on SIGINT or SIGTERM.
///
/// The first signal starts draining. Later ones are logged and ignored: the
/// in-flight task is always allowed to finish.
pub fn listen_for_signals(handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match wait_for_signal().await {
                Ok(name) if !handle.is_triggered() => {
                    info!(signal = name, "Received {}, finishing current task and stopping", name);
                    handle.trigger();
                }
                Ok(name) => {
                    warn!(signal = name, "Already shutting down; waiting for the current task to finish");
                }
                Err(e) => {
                    error!("Failed to listen for termination signals: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
