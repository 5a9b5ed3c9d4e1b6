//! The interactive client: wires the ingress thread, the dispatch loop, the
//! delivery tracker and the signal listener around one broker session.
//!
//! ```text
//! stdin ──ingress──▶ commands(1) ──▶ dispatch ──send──▶ Session
//!                                       ▲   ◀──inbound──┘  │
//!                                       └── tracker ◀─outcomes
//! SIGINT/SIGTERM ──▶ Shutdown ◀── quit / end of input / fatal driver error
//! ```

pub mod dispatch;
pub mod ingress;
pub mod shutdown;
pub mod signal;
pub mod tracker;

use tokio::sync::mpsc;
use tracing::{error, info};

pub use dispatch::{DispatchReport, Dispatcher};
pub use ingress::Command;
pub use shutdown::{MAX_POLL_INTERVAL, Shutdown, ShutdownReason};

use crate::config::{BrokerSettings, Settings};
use crate::driver::{self, Mode, Session};
use crate::utils::error::StartupError;

/// One command in flight between the operator and the dispatch loop.
pub const COMMAND_BUFFER: usize = 1;

/// Runs one interactive session against the configured broker.
///
/// Connection and declaration failures are returned before any input is
/// read. Once the dispatch loop runs, message-level failures are reported and
/// the session continues until shutdown.
pub async fn run(settings: Settings, mode: Mode) -> Result<DispatchReport, StartupError> {
    let shutdown = Shutdown::new();
    let signals = signal::spawn_signal_listener(shutdown.clone());
    let destination = settings.broker.destination.clone();

    let mut session = match open_session(&settings.broker, mode, &shutdown).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            signals.abort();
            return Ok(DispatchReport {
                reason: shutdown.reason(),
                ..Default::default()
            });
        }
        Err(e) => {
            signals.abort();
            return Err(e);
        }
    };

    match mode {
        Mode::Producer => println!(
            "Enter messages to send to {destination}. Type 'exit' or press Ctrl+C to quit."
        ),
        Mode::Consumer => println!(
            "Consuming messages from {destination}. Type 'exit' or press Ctrl+C to quit."
        ),
    }

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    // The ingress thread is never joined: it may sit in a blocking read of
    // stdin that only process exit ends.
    if let Err(e) = ingress::spawn(commands_tx, shutdown.clone()) {
        session.close().await;
        signals.abort();
        return Err(e.into());
    }

    let mut stdout = tokio::io::stdout();
    let outcome = Dispatcher::new(session, mode, &settings.app, shutdown)
        .run(commands_rx, &mut stdout)
        .await;
    signals.abort();

    let report = outcome?;
    info!(?report, "session finished");
    Ok(report)
}

/// Connects and declares the destination, giving up as soon as shutdown
/// fires. Returns `None` when shutdown won; a session opened by then is
/// closed.
pub(crate) async fn open_session(
    settings: &BrokerSettings,
    mode: Mode,
    shutdown: &Shutdown,
) -> Result<Option<Box<dyn Session>>, StartupError> {
    let mut session = tokio::select! {
        biased;
        reason = shutdown.fired() => {
            info!(%reason, "shutdown before the broker connection was up");
            return Ok(None);
        }
        connected = driver::connect(settings, mode) => connected?,
    };
    info!(kind = %settings.kind, "connected to broker");

    let destination = settings.destination.as_str();
    let declared = tokio::select! {
        biased;
        _ = shutdown.fired() => None,
        declared = session.declare_destination(destination) => Some(declared),
    };

    match declared {
        Some(Ok(())) => {
            info!(%destination, "destination declared");
            Ok(Some(session))
        }
        Some(Err(e)) => {
            error!(error = %e, %destination, "failed to declare destination");
            session.close().await;
            Err(e.into())
        }
        None => {
            info!(%destination, "shutdown while declaring the destination");
            session.close().await;
            Ok(None)
        }
    }
}
