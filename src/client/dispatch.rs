//! The dispatch loop: owns the session and reacts to shutdown, driver events
//! and operator commands until shutdown, then drains and closes.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::ingress::Command;
use crate::client::shutdown::{Shutdown, ShutdownReason};
use crate::client::tracker::{self, TrackerStats};
use crate::config::AppSettings;
use crate::driver::{
    DeliveryOutcome, InboundMessage, InboundStream, MessageId, Mode, SendReceipt, Session,
};
use crate::utils::error::{DriverError, ReceiveError};

/// Capacity of the tracker → dispatch outcome channel.
pub const OUTCOME_BUFFER: usize = 64;

/// Deadline used when the drain timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Summary of one session, returned when the loop has closed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub reason: Option<ShutdownReason>,
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    pub send_errors: usize,
    pub received: usize,
    pub receive_errors: usize,
    /// Sends still unconfirmed when the drain timeout expired.
    pub abandoned: usize,
}

pub struct Dispatcher {
    session: Box<dyn Session>,
    mode: Mode,
    shutdown: Shutdown,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        session: Box<dyn Session>,
        mode: Mode,
        app: &AppSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            session,
            mode,
            shutdown,
            poll_interval: app.poll_interval(),
            drain_timeout: app.drain_timeout(),
        }
    }

    /// Runs until the shutdown signal fires, then drains (producer mode) and
    /// closes the session exactly once.
    ///
    /// Waits on, in priority order: the shutdown signal, the next driver
    /// event, the next command, and the poll tick. `send` is awaited outside
    /// that wait so it is never abandoned halfway.
    ///
    /// Fails only when a consumer session cannot start its receive stream; the
    /// session is closed in that case too.
    pub async fn run<W>(
        self,
        mut commands: mpsc::Receiver<Command>,
        out: &mut W,
    ) -> Result<DispatchReport, DriverError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Dispatcher {
            mut session,
            mode,
            shutdown,
            poll_interval,
            drain_timeout,
        } = self;

        let mut events = match mode {
            Mode::Consumer => match session.receive().await {
                Ok(stream) => Events::Inbound(Some(stream)),
                Err(e) => {
                    error!(error = %e, "failed to start consuming");
                    session.close().await;
                    return Err(e);
                }
            },
            Mode::Producer => {
                let (forward, outcomes) = mpsc::channel(OUTCOME_BUFFER);
                let tracker = session
                    .take_outcomes()
                    .map(|stream| tracker::spawn(stream, forward));
                Events::Outcomes {
                    rx: Some(outcomes),
                    tracker,
                }
            }
        };

        let mut core = Core {
            session,
            mode,
            shutdown: shutdown.clone(),
            out,
            in_flight: HashSet::new(),
            report: DispatchReport::default(),
            closed: false,
        };

        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(%mode, destination = %core.session.destination(), "dispatch loop running");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.fired() => break,
                event = events.next() => core.handle_event(event).await,
                command = commands.recv() => core.handle_command(command).await,
                _ = ticker.tick() => {
                    if shutdown.is_fired() {
                        break;
                    }
                }
            }
        }

        // Anything still buffered from the operator is dropped, and a blocked
        // ingress hand-off fails instead of waiting forever.
        drop(commands);

        core.report.reason = shutdown.reason();
        info!(reason = ?core.report.reason, "dispatch loop shutting down");
        let farewell = match mode {
            Mode::Producer => "Shutting down producer...",
            Mode::Consumer => "Shutting down consumer...",
        };
        core.say(farewell).await;

        match mode {
            Mode::Producer => core.drain(&mut events, drain_timeout).await,
            // Undisplayed inbound messages are dropped with the stream.
            Mode::Consumer => events.stop_inbound(),
        }

        core.close().await;

        if let Events::Outcomes {
            tracker: Some(handle),
            ..
        } = events
        {
            await_tracker(handle, poll_interval).await;
        }

        Ok(core.report)
    }
}

async fn await_tracker(handle: JoinHandle<TrackerStats>, grace: Duration) {
    match time::timeout(grace, handle).await {
        Ok(Ok(stats)) => debug!(?stats, "delivery tracker finished"),
        Ok(Err(error)) => warn!(?error, "delivery tracker failed"),
        Err(_) => debug!("delivery tracker still draining late outcomes, detaching"),
    }
}

enum Event {
    Inbound(Result<InboundMessage, ReceiveError>),
    InboundEnded,
    Outcome(DeliveryOutcome),
    OutcomesEnded,
}

/// Driver-side event source for the current mode.
enum Events {
    Inbound(Option<InboundStream>),
    Outcomes {
        rx: Option<mpsc::Receiver<DeliveryOutcome>>,
        tracker: Option<JoinHandle<TrackerStats>>,
    },
}

impl Events {
    /// Next event; pends forever once the source is exhausted. Cancel safe.
    async fn next(&mut self) -> Event {
        match self {
            Events::Inbound(stream) => {
                let Some(inbound) = stream.as_mut() else {
                    return std::future::pending().await;
                };
                match inbound.next().await {
                    Some(item) => Event::Inbound(item),
                    None => {
                        *stream = None;
                        Event::InboundEnded
                    }
                }
            }
            Events::Outcomes { rx, .. } => {
                let Some(outcomes) = rx.as_mut() else {
                    return std::future::pending().await;
                };
                match outcomes.recv().await {
                    Some(outcome) => Event::Outcome(outcome),
                    None => {
                        *rx = None;
                        Event::OutcomesEnded
                    }
                }
            }
        }
    }

    fn stop_inbound(&mut self) {
        if let Events::Inbound(stream) = self {
            stream.take();
        }
    }

    fn outcomes_closed(&self) -> bool {
        matches!(self, Events::Outcomes { rx: None, .. })
    }
}

/// State touched by the event handlers.
struct Core<'a, W> {
    session: Box<dyn Session>,
    mode: Mode,
    shutdown: Shutdown,
    out: &'a mut W,
    in_flight: HashSet<MessageId>,
    report: DispatchReport,
    closed: bool,
}

impl<W> Core<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Inbound(Ok(message)) => {
                self.report.received += 1;
                let text = message.text();
                info!(bytes = message.payload.len(), received_at = %message.received_at, "message consumed");
                self.say(&format!("Received message: {text}")).await;
            }
            Event::Inbound(Err(err)) => {
                self.report.receive_errors += 1;
                if err.fatal {
                    error!(error = %err, "fatal consumer error");
                    self.say(&format!("Fatal consumer error: {err}")).await;
                    self.shutdown.fire(ShutdownReason::FatalDriverError);
                } else {
                    warn!(error = %err, "consumer error");
                    self.say(&format!("Consumer error: {err}")).await;
                }
            }
            Event::InboundEnded => {
                error!("receive stream ended");
                self.say("Message stream closed by the broker").await;
                self.shutdown.fire(ShutdownReason::FatalDriverError);
            }
            Event::Outcome(outcome) => self.record_outcome(outcome).await,
            Event::OutcomesEnded => debug!("outcome stream closed"),
        }
    }

    async fn handle_command(&mut self, command: Option<Command>) {
        match command {
            None => {
                self.shutdown.fire(ShutdownReason::EndOfInput);
            }
            Some(Command::Quit) => {
                self.shutdown.fire(ShutdownReason::Quit);
            }
            Some(Command::Publish { text }) => match self.mode {
                Mode::Producer => self.publish(text).await,
                Mode::Consumer => debug!("ignoring input while consuming"),
            },
        }
    }

    async fn publish(&mut self, text: String) {
        // A signal may have landed while this command was being picked.
        if self.shutdown.is_fired() {
            debug!("shutdown in progress, publish dropped");
            return;
        }

        let bytes = text.len();
        match self.session.send(text.into_bytes()).await {
            Ok(SendReceipt::Pending(id)) => {
                self.report.sent += 1;
                info!(message_id = %id, bytes, "message queued for delivery");
                self.in_flight.insert(id);
            }
            Ok(SendReceipt::Settled(outcome)) => {
                self.report.sent += 1;
                tracker::report(&outcome);
                self.record_outcome(outcome).await;
            }
            Err(e) => {
                self.report.send_errors += 1;
                error!(error = %e, bytes, "failed to publish message");
                self.say(&format!("Failed to publish message: {e}")).await;
            }
        }
    }

    async fn record_outcome(&mut self, outcome: DeliveryOutcome) {
        self.in_flight.remove(&outcome.message_id);
        match outcome.error {
            None => self.report.delivered += 1,
            Some(reason) => {
                self.report.failed += 1;
                self.say(&format!("Delivery failed: {reason}")).await;
            }
        }
    }

    /// Waits for in-flight sends to settle, at most `timeout`.
    async fn drain(&mut self, events: &mut Events, timeout: Duration) {
        if self.in_flight.is_empty() {
            return;
        }

        info!(
            outstanding = self.in_flight.len(),
            ?timeout,
            "waiting for outstanding deliveries"
        );
        let now = time::Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        while !self.in_flight.is_empty() && !events.outcomes_closed() {
            tokio::select! {
                event = events.next() => self.handle_event(event).await,
                _ = time::sleep_until(deadline) => break,
            }
        }

        if !self.in_flight.is_empty() {
            self.report.abandoned = self.in_flight.len();
            warn!(
                unconfirmed = self.report.abandoned,
                "closing session with unconfirmed deliveries"
            );
            let line = format!(
                "{} message(s) still unconfirmed at shutdown",
                self.report.abandoned
            );
            self.say(&line).await;
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.close().await;
        info!(destination = %self.session.destination(), "session closed");
    }

    async fn say(&mut self, line: &str) {
        if let Err(error) = write_line(&mut *self.out, line).await {
            debug!(?error, "failed to write to operator output");
        }
    }
}

async fn write_line<W>(out: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
