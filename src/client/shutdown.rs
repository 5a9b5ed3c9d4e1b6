//! Single-fire shutdown signal shared by every loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Upper bound on how long any loop may go without checking for shutdown.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What started the shutdown. Only the first reason is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS termination signal, by name.
    Signal(&'static str),
    /// The operator typed a quit token.
    Quit,
    /// The command source went away without a quit.
    EndOfInput,
    /// The driver reported an unrecoverable error.
    FatalDriverError,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received signal {name}"),
            ShutdownReason::Quit => f.write_str("operator requested exit"),
            ShutdownReason::EndOfInput => f.write_str("input closed"),
            ShutdownReason::FatalDriverError => f.write_str("fatal driver error"),
        }
    }
}

/// Broadcast cancellation token. Cloning shares the same underlying flag.
///
/// Firing is idempotent and never resets.
#[derive(Debug, Clone)]
pub struct Shutdown {
    state: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Fires the signal. Returns `true` only for the call that actually fired it.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        let fired = self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });

        if fired {
            info!(%reason, "shutdown requested");
        }
        fired
    }

    pub fn is_fired(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.state.borrow()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    /// Cancel safe.
    pub async fn fired(&self) -> ShutdownReason {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::EndOfInput),
            Err(_) => self.reason().unwrap_or(ShutdownReason::EndOfInput),
        }
    }
}
