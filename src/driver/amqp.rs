//! RabbitMQ driver on lapin.
//!
//! The destination is a durable queue published to through the default
//! exchange. Producers run the channel in confirm mode and report each
//! publisher confirm as a delivery outcome; consumers auto-ack.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::driver::{
    DeliveryOutcome, InboundMessage, InboundStream, Mode, OutcomeStream, SendReceipt, Session,
    new_message_id,
};
use crate::utils::error::{DriverError, ReceiveError};

const CONSUMER_TAG: &str = "brokerctl";
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    destination: String,
    mode: Mode,
    outcomes_tx: Option<UnboundedSender<DeliveryOutcome>>,
    outcomes_rx: Option<OutcomeStream>,
    receiving: bool,
    closed: bool,
}

impl AmqpSession {
    pub async fn connect(settings: &BrokerSettings, mode: Mode) -> Result<Self, DriverError> {
        let uri = connection_uri(settings);
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                DriverError::Connection(format!("{}:{}: {e}", settings.host, settings.port))
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DriverError::Connection(format!("failed to open channel: {e}")))?;

        if mode == Mode::Producer {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| DriverError::Connection(format!("failed to enable confirms: {e}")))?;
        }
        info!(host = %settings.host, port = settings.port, "connected to RabbitMQ");

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Ok(Self {
            connection,
            channel,
            destination: settings.destination.clone(),
            mode,
            outcomes_tx: Some(outcomes_tx),
            outcomes_rx: Some(outcomes_rx),
            receiving: false,
            closed: false,
        })
    }
}

fn connection_uri(settings: &BrokerSettings) -> String {
    match &settings.username {
        Some(username) => format!(
            "amqp://{}:{}@{}:{}/%2f",
            username,
            settings.password.as_deref().unwrap_or_default(),
            settings.host,
            settings.port
        ),
        None => format!("amqp://{}:{}/%2f", settings.host, settings.port),
    }
}

#[async_trait]
impl Session for AmqpSession {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn declare_destination(&mut self, name: &str) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| DriverError::Declaration {
                destination: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(queue = name, messages = queue.message_count(), "queue declared");
        Ok(())
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<SendReceipt, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }

        let id = new_message_id();
        let payload_len = payload.len();
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_message_id(id.clone().into());
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.destination,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| DriverError::Send(e.to_string()))?;

        let Some(outcomes) = self.outcomes_tx.clone() else {
            return Err(DriverError::Closed);
        };
        let destination = self.destination.clone();
        let message_id = id.clone();
        tokio::spawn(async move {
            let outcome = match confirm.await {
                Ok(Confirmation::Nack(_)) => DeliveryOutcome::failed(
                    message_id,
                    &destination,
                    payload_len,
                    "broker rejected the message",
                ),
                Ok(_) => DeliveryOutcome::delivered(message_id, &destination, payload_len),
                Err(e) => {
                    DeliveryOutcome::failed(message_id, &destination, payload_len, e.to_string())
                }
            };
            let _ = outcomes.send(outcome);
        });

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
        if self.mode == Mode::Producer {
            return Err(DriverError::Unsupported("receiving on a producer channel"));
        }

        let options = BasicConsumeOptions {
            no_ack: true,
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(&self.destination, CONSUMER_TAG, options, FieldTable::default())
            .await
            .map_err(|e| DriverError::Receive(e.to_string()))?;
        self.receiving = true;

        // lapin reports a dead channel as an error item, which ends the
        // session.
        let inbound = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(InboundMessage::new(delivery.data)),
            Err(e) => Err(ReceiveError::fatal(e.to_string())),
        });
        Ok(inbound.boxed())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outcomes_tx.take();

        if let Err(error) = self.channel.close(REPLY_SUCCESS, "closing").await {
            warn!(%error, "failed to close AMQP channel");
        }
        if let Err(error) = self.connection.close(REPLY_SUCCESS, "closing").await {
            warn!(%error, "failed to close AMQP connection");
        }
        debug!(queue = %self.destination, "amqp session closed");
    }
}
