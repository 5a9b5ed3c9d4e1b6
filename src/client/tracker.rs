//! Delivery tracker: drains a session's outcome stream on its own task.

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::driver::{DeliveryOutcome, OutcomeStream};

/// Counts reported by a tracker once its stream has ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Logs one outcome with its destination, size and error.
pub fn report(outcome: &DeliveryOutcome) {
    match &outcome.error {
        None => info!(
            message_id = %outcome.message_id,
            destination = %outcome.destination,
            bytes = outcome.payload_len,
            "message delivered"
        ),
        Some(reason) => error!(
            message_id = %outcome.message_id,
            destination = %outcome.destination,
            bytes = outcome.payload_len,
            %reason,
            "delivery failed"
        ),
    }
}

/// Spawns the tracker. Every outcome is reported and then forwarded to the
/// dispatch loop, in the order the driver emitted them. The task ends when
/// the session closes its outcome stream.
///
/// Forwarding failures (dispatch loop already gone) are ignored; the tracker
/// keeps reporting until the stream ends.
pub fn spawn(mut outcomes: OutcomeStream, forward: Sender<DeliveryOutcome>) -> JoinHandle<TrackerStats> {
    tokio::spawn(async move {
        let mut stats = TrackerStats::default();

        while let Some(outcome) = outcomes.recv().await {
            report(&outcome);
            if outcome.is_success() {
                stats.delivered += 1;
            } else {
                stats.failed += 1;
            }

            if forward.send(outcome).await.is_err() {
                debug!("dispatch loop no longer listening for outcomes");
            }
        }

        debug!(?stats, "outcome stream closed, tracker exiting");
        stats
    })
}
