//! Broker drivers.
//!
//! A driver opens a [`Session`]: one connection bound to one destination.
//! The dispatch loop owns the session exclusively; the only things that leave
//! it are the inbound message stream and the delivery outcome stream, each
//! handed out once.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::config::{BrokerSettings, DriverKind};
use crate::utils::error::{DriverError, ReceiveError};

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

/// Identifier a driver assigns to each send.
pub type MessageId = String;

/// Items of a session's receive stream.
pub type InboundStream = BoxStream<'static, Result<InboundMessage, ReceiveError>>;

/// Asynchronous delivery reports. Ends when the session closes.
pub type OutcomeStream = UnboundedReceiver<DeliveryOutcome>;

/// Which side of the destination the session works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Producer,
    Consumer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Producer => f.write_str("producer"),
            Mode::Consumer => f.write_str("consumer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Final state of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub message_id: MessageId,
    pub destination: String,
    pub payload_len: usize,
    /// `None` when the broker accepted the message.
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(message_id: MessageId, destination: &str, payload_len: usize) -> Self {
        Self {
            message_id,
            destination: destination.to_string(),
            payload_len,
            error: None,
        }
    }

    pub fn failed(
        message_id: MessageId,
        destination: &str,
        payload_len: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            destination: destination.to_string(),
            payload_len,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// What a send returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReceipt {
    /// The driver already knows the final outcome.
    Settled(DeliveryOutcome),
    /// The outcome will arrive on the outcome stream under this id.
    Pending(MessageId),
}

/// One connection bound to one destination.
///
/// `send` is only ever called from one task at a time, and so is the receive
/// stream; the two directions may be serviced independently by the driver.
#[async_trait]
pub trait Session: Send {
    fn destination(&self) -> &str;

    /// Creates or subscribes the destination. Idempotent.
    async fn declare_destination(&mut self, name: &str) -> Result<(), DriverError>;

    async fn send(&mut self, payload: Vec<u8>) -> Result<SendReceipt, DriverError>;

    /// Hands out the outcome stream. Only the first call returns it.
    fn take_outcomes(&mut self) -> Option<OutcomeStream>;

    /// Starts consuming. The stream is infinite unless the driver dies, and
    /// it cannot be restarted: a second call fails.
    async fn receive(&mut self) -> Result<InboundStream, DriverError>;

    /// Releases the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens a session with the driver named in `settings`.
pub async fn connect(settings: &BrokerSettings, mode: Mode) -> Result<Box<dyn Session>, DriverError> {
    info!(
        kind = %settings.kind,
        host = %settings.host,
        port = settings.port,
        destination = %settings.destination,
        %mode,
        "connecting to broker"
    );

    match settings.kind {
        DriverKind::Memory => Ok(Box::new(memory::MemorySession::standalone(
            &settings.destination,
        ))),
        DriverKind::Websocket => Ok(Box::new(
            websocket::WebSocketSession::connect(settings, mode).await?,
        )),
        #[cfg(feature = "amqp")]
        DriverKind::Amqp => Ok(Box::new(amqp::AmqpSession::connect(settings, mode).await?)),
        #[cfg(not(feature = "amqp"))]
        DriverKind::Amqp => Err(DriverError::Connection(
            "amqp support is not compiled in (enable the `amqp` feature)".to_string(),
        )),
        #[cfg(feature = "kafka")]
        DriverKind::Kafka => Ok(Box::new(kafka::KafkaSession::connect(settings, mode)?)),
        #[cfg(not(feature = "kafka"))]
        DriverKind::Kafka => Err(DriverError::Connection(
            "kafka support is not compiled in (enable the `kafka` feature)".to_string(),
        )),
    }
}

pub(crate) fn new_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}
