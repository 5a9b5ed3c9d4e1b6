//! Kafka driver on rdkafka.
//!
//! Producers hand each record to librdkafka and report its delivery future
//! as an outcome. Consumers join a consumer group and read from the earliest
//! offset the group has not committed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use rdkafka::ClientConfig;
use rdkafka::Message as _;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::driver::{
    DeliveryOutcome, InboundMessage, InboundStream, Mode, OutcomeStream, SendReceipt, Session,
    new_message_id,
};
use crate::utils::error::{DriverError, ReceiveError};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum Client {
    Producer(FutureProducer),
    Consumer(Arc<StreamConsumer>),
}

pub struct KafkaSession {
    client: Client,
    destination: String,
    outcomes_tx: Option<UnboundedSender<DeliveryOutcome>>,
    outcomes_rx: Option<OutcomeStream>,
    receiving: bool,
    closed: bool,
}

impl KafkaSession {
    /// Creates the librdkafka client. Brokers are contacted lazily, so an
    /// unreachable cluster shows up as failed deliveries or consumer errors.
    pub fn connect(settings: &BrokerSettings, mode: Mode) -> Result<Self, DriverError> {
        let bootstrap = format!("{}:{}", settings.host, settings.port);
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &bootstrap);
        if let Some(username) = &settings.username {
            config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set(
                    "sasl.password",
                    settings.password.as_deref().unwrap_or_default(),
                );
        }

        let client = match mode {
            Mode::Producer => {
                let producer: FutureProducer = config
                    .create()
                    .map_err(|e| DriverError::Connection(format!("kafka producer: {e}")))?;
                Client::Producer(producer)
            }
            Mode::Consumer => {
                let consumer: StreamConsumer = config
                    .set("group.id", &settings.group_id)
                    .set("auto.offset.reset", "earliest")
                    .create()
                    .map_err(|e| DriverError::Connection(format!("kafka consumer: {e}")))?;
                Client::Consumer(Arc::new(consumer))
            }
        };
        info!(%bootstrap, %mode, "kafka client created");

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            destination: settings.destination.clone(),
            outcomes_tx: Some(outcomes_tx),
            outcomes_rx: Some(outcomes_rx),
            receiving: false,
            closed: false,
        })
    }
}

/// Whether a consumer error leaves the client unusable.
pub fn is_fatal(error: &KafkaError) -> bool {
    matches!(error, KafkaError::MessageConsumptionFatal(_))
        || error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

#[async_trait]
impl Session for KafkaSession {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn declare_destination(&mut self, name: &str) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        match &self.client {
            // Topics are created broker-side on first produce.
            Client::Producer(_) => Ok(()),
            Client::Consumer(consumer) => {
                consumer
                    .subscribe(&[name])
                    .map_err(|e| DriverError::Declaration {
                        destination: name.to_string(),
                        reason: e.to_string(),
                    })?;
                debug!(topic = name, "subscribed");
                Ok(())
            }
        }
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<SendReceipt, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let Client::Producer(producer) = &self.client else {
            return Err(DriverError::Unsupported("sending from a consumer"));
        };
        let Some(outcomes) = self.outcomes_tx.clone() else {
            return Err(DriverError::Closed);
        };

        let id = new_message_id();
        let payload_len = payload.len();
        let record = FutureRecord::to(&self.destination)
            .key(id.as_str())
            .payload(&payload);
        let delivery = producer
            .send_result(record)
            .map_err(|(e, _)| DriverError::Send(e.to_string()))?;

        let destination = self.destination.clone();
        let message_id = id.clone();
        tokio::spawn(async move {
            let outcome = match delivery.await {
                Ok(Ok(_)) => DeliveryOutcome::delivered(message_id, &destination, payload_len),
                Ok(Err((e, _))) => {
                    DeliveryOutcome::failed(message_id, &destination, payload_len, e.to_string())
                }
                Err(_) => DeliveryOutcome::failed(
                    message_id,
                    &destination,
                    payload_len,
                    "producer dropped the message",
                ),
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
        let Client::Consumer(consumer) = &self.client else {
            return Err(DriverError::Unsupported("receiving from a producer"));
        };
        if self.receiving {
            return Err(DriverError::Receive("receive stream already started".into()));
        }
        self.receiving = true;

        let inbound = stream::unfold(consumer.clone(), |consumer| async move {
            let item = match consumer.recv().await {
                Ok(message) => Ok(InboundMessage::new(
                    message.payload().unwrap_or_default().to_vec(),
                )),
                Err(e) if is_fatal(&e) => Err(ReceiveError::fatal(e.to_string())),
                Err(e) => Err(ReceiveError::recoverable(e.to_string())),
            };
            Some((item, consumer))
        });
        Ok(inbound.boxed())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match &self.client {
            Client::Producer(producer) => {
                let producer = producer.clone();
                let flushed =
                    tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await;
                match flushed {
                    Ok(Ok(())) => debug!("kafka producer flushed"),
                    Ok(Err(error)) => warn!(%error, "kafka producer flush failed"),
                    Err(error) => warn!(%error, "kafka producer flush task failed"),
                }
            }
            Client::Consumer(consumer) => consumer.unsubscribe(),
        }

        self.outcomes_tx.take();
        debug!(topic = %self.destination, "kafka session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_classified() {
        assert!(is_fatal(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        )));
        assert!(!is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
    }
}
