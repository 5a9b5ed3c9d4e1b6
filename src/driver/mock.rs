//! Scripted session for exercising the client core.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc::{self, UnboundedSender, WeakUnboundedSender};
use tokio::time::Instant;

use crate::driver::{
    DeliveryOutcome, InboundMessage, InboundStream, MessageId, OutcomeStream, SendReceipt,
    Session,
};
use crate::utils::error::{DriverError, ReceiveError};

/// How the mock settles sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// `Pending`, success outcome emitted straight away.
    Acknowledged,
    /// `Pending`, outcome emitted when the test calls [`MockTap::complete`].
    Deferred,
    /// `Settled` success.
    Synchronous,
}

#[derive(Default)]
struct TapState {
    sent: Vec<(MessageId, String)>,
    close_calls: usize,
    closed_at: Option<Instant>,
}

/// Test-side view of a [`MockSession`].
#[derive(Clone)]
pub struct MockTap {
    state: Arc<Mutex<TapState>>,
    outcomes: WeakUnboundedSender<DeliveryOutcome>,
    pulled: Arc<AtomicUsize>,
}

impl MockTap {
    pub fn sent(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.sent.iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn sent_ids(&self) -> Vec<MessageId> {
        let state = self.state.lock().unwrap();
        state.sent.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().closed_at
    }

    /// Number of items taken from the receive stream.
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    /// Emits the outcome of a deferred send. Returns false once the session
    /// has closed its outcome stream.
    pub fn complete(&self, id: &MessageId, error: Option<&str>) -> bool {
        let Some(tx) = self.outcomes.upgrade() else {
            return false;
        };
        let payload_len = {
            let state = self.state.lock().unwrap();
            state
                .sent
                .iter()
                .find(|(sent_id, _)| sent_id == id)
                .map(|(_, text)| text.len())
                .unwrap_or_default()
        };
        let outcome = match error {
            None => DeliveryOutcome::delivered(id.clone(), "mock", payload_len),
            Some(error) => DeliveryOutcome::failed(id.clone(), "mock", payload_len, error),
        };
        tx.send(outcome).is_ok()
    }
}

pub struct MockSession {
    destination: String,
    delivery: Delivery,
    failing: HashSet<String>,
    state: Arc<Mutex<TapState>>,
    outcomes_tx: Option<UnboundedSender<DeliveryOutcome>>,
    outcomes_rx: Option<OutcomeStream>,
    inbound: Option<Vec<Result<InboundMessage, ReceiveError>>>,
    pulled: Arc<AtomicUsize>,
    next_id: usize,
    closed: bool,
}

impl MockSession {
    pub fn producer(delivery: Delivery) -> (Self, MockTap) {
        Self::build(delivery, None)
    }

    /// Consumer whose receive stream yields `items` and then stays silent.
    pub fn consumer(items: Vec<Result<InboundMessage, ReceiveError>>) -> (Self, MockTap) {
        Self::build(Delivery::Acknowledged, Some(items))
    }

    /// Sends of exactly this text fail with a send error.
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }

    fn build(
        delivery: Delivery,
        inbound: Option<Vec<Result<InboundMessage, ReceiveError>>>,
    ) -> (Self, MockTap) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(TapState::default()));
        let pulled = Arc::new(AtomicUsize::new(0));
        let tap = MockTap {
            state: state.clone(),
            outcomes: tx.downgrade(),
            pulled: pulled.clone(),
        };
        let session = Self {
            destination: "mock".to_string(),
            delivery,
            failing: HashSet::new(),
            state,
            outcomes_tx: Some(tx),
            outcomes_rx: Some(rx),
            inbound,
            pulled,
            next_id: 0,
            closed: false,
        };
        (session, tap)
    }
}

#[async_trait]
impl Session for MockSession {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn declare_destination(&mut self, _name: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<SendReceipt, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let text = String::from_utf8_lossy(&payload).into_owned();
        if self.failing.contains(&text) {
            return Err(DriverError::Send(format!("refused `{text}`")));
        }

        self.next_id += 1;
        let id = format!("m{}", self.next_id);
        self.state
            .lock()
            .unwrap()
            .sent
            .push((id.clone(), text.clone()));

        match self.delivery {
            Delivery::Acknowledged => {
                if let Some(tx) = &self.outcomes_tx {
                    let _ = tx.send(DeliveryOutcome::delivered(id.clone(), "mock", text.len()));
                }
                Ok(SendReceipt::Pending(id))
            }
            Delivery::Deferred => Ok(SendReceipt::Pending(id)),
            Delivery::Synchronous => Ok(SendReceipt::Settled(DeliveryOutcome::delivered(
                id,
                "mock",
                text.len(),
            ))),
        }
    }

    fn take_outcomes(&mut self) -> Option<OutcomeStream> {
        self.outcomes_rx.take()
    }

    async fn receive(&mut self) -> Result<InboundStream, DriverError> {
        let items = self
            .inbound
            .take()
            .ok_or(DriverError::Receive("no scripted receive stream".into()))?;
        let pulled = self.pulled.clone();
        let scripted = stream::iter(items).inspect(move |_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        });
        Ok(scripted.chain(stream::pending()).boxed())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        if !self.closed {
            self.closed = true;
            state.closed_at = Some(Instant::now());
            self.outcomes_tx.take();
        }
    }
}
