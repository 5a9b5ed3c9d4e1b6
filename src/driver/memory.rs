//! Driver backed by the in-process [`Broker`].
//!
//! Sessions created from the same [`SharedBroker`] see each other's messages,
//! which makes a producer/consumer pair testable in one process. From the CLI
//! each session gets its own broker, so publishing is a dry run.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use crate::broker::engine::lock;
use crate::broker::message::Message;
use crate::broker::topic::SubscriberId;
use crate::broker::{Broker, SharedBroker, Subscriber};
use crate::driver::{
    DeliveryOutcome, InboundMessage, InboundStream, OutcomeStream, SendReceipt, Session,
    new_message_id,
};
use crate::utils::error::{DriverError, ReceiveError};

pub struct MemorySession {
    broker: SharedBroker,
    destination: String,
    outcomes_tx: Option<UnboundedSender<DeliveryOutcome>>,
    outcomes_rx: Option<OutcomeStream>,
    subscriber: Option<SubscriberId>,
    receiving: bool,
    closed: bool,
}

impl MemorySession {
    pub fn new(broker: SharedBroker, destination: &str) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            destination: destination.to_string(),
            outcomes_tx: Some(outcomes_tx),
            outcomes_rx: Some(outcomes_rx),
            subscriber: None,
            receiving: false,
            closed: false,
        }
    }

    /// A session on a private broker of its own.
    pub fn standalone(destination: &str) -> Self {
        Self::new(Broker::shared(), destination)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn declare_destination(&mut self, name: &str) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if lock(&self.broker).declare_topic(name) {
            debug!(topic = name, "topic declared");
        }
        Ok(())
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<SendReceipt, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }

        let id = new_message_id();
        let len = payload.len();
        let published =
            lock(&self.broker).publish(Message::new(id.clone(), &self.destination, payload));

        let outcome = match published {
            Ok(fanout) => {
                debug!(message_id = %id, fanout, "published to in-memory topic");
                DeliveryOutcome::delivered(id.clone(), &self.destination, len)
            }
            Err(e) => DeliveryOutcome::failed(id.clone(), &self.destination, len, e.to_string()),
        };

        if let Some(tx) = &self.outcomes_tx {
            let _ = tx.send(outcome);
        }
        Ok(SendReceipt::Pending(id))
    }

    fn take_outcomes(&mut self) -> Option<OutcomeStream> {
        self.outcomes_rx.take()
    }

    async fn receive(&mut self) -> Result<InboundStream, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if self.receiving {
            return Err(DriverError::Receive("receive stream already started".into()));
        }
        self.receiving = true;

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let subscriber = Subscriber::new(tx);
        let id = subscriber.id.clone();
        {
            let mut broker = lock(&self.broker);
            broker.register_client(subscriber);
            broker.subscribe(&self.destination, id.clone());
        }
        debug!(subscriber = %id, topic = %self.destination, "subscribed");
        self.subscriber = Some(id);

        // Once the broker drops the subscription the stream reports it as
        // fatal and then ends.
        let inbound = stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Some(msg) => Some((Ok(InboundMessage::new(msg.payload)), Some(rx))),
                None => Some((Err(ReceiveError::fatal("subscription was dropped")), None)),
            }
        });
        Ok(inbound.boxed())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(id) = self.subscriber.take() {
            lock(&self.broker).cleanup_client(&id);
        }
        self.outcomes_tx.take();
        debug!(topic = %self.destination, "memory session closed");
    }
}
