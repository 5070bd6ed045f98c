//! Graceful-shutdown signal wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the process signal listener, exactly once. On SIGINT/SIGTERM
/// the flag flips; the consume loop finishes the in-flight delivery
/// (ack + inbox update) and then closes channel and connection.
pub fn install(flag: Arc<AtomicBool>) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining current delivery");
        flag.store(true, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(error) => {
            warn!(error = %error, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
