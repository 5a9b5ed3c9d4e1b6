use std::io;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::client::shutdown::{Shutdown, ShutdownReason};

/// Spawns a task that turns SIGINT/SIGTERM (Ctrl-C off Unix) into a shutdown.
///
/// The task also ends, without firing, when something else fires the signal.
pub fn spawn_signal_listener(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            received = wait_for_signal() => match received {
                Ok(name) => {
                    if shutdown.fire(ShutdownReason::Signal(name)) {
                        println!("\nExiting application");
                    }
                }
                Err(error) => warn!(?error, "failed to install signal handler"),
            },
            _ = shutdown.fired() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => ctrl_c.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "CTRL_C")
}
