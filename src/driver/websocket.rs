//! Driver for a popsub server, spoken over a WebSocket with JSON frames.
//!
//! The socket is split: a writer task owns the sink and is fed through an
//! unbounded channel. For consumers the read half becomes the receive
//! stream; for producers a watcher task reads it and logs `error` frames.
//! Publishes are settled once the frame is on the wire, since popsub does
//! not confirm them and its errors do not name the rejected message.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt, stream};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::BrokerSettings;
use crate::driver::{
    DeliveryOutcome, InboundMessage, InboundStream, MessageId, Mode, OutcomeStream, SendReceipt,
    Session, new_message_id,
};
use crate::transport::{ClientMessage, ServerMessage};
use crate::utils::error::{DriverError, ReceiveError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, WsMessage>;

struct Outgoing {
    frame: WsMessage,
    receipt: Option<PendingSend>,
}

struct PendingSend {
    id: MessageId,
    payload_len: usize,
}

pub struct WebSocketSession {
    destination: String,
    mode: Mode,
    outgoing: Option<UnboundedSender<Outgoing>>,
    reader: Option<WsReader>,
    writer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<usize>>,
    outcomes_rx: Option<OutcomeStream>,
    subscribed: bool,
    closed: bool,
}

impl WebSocketSession {
    /// Opens `ws://host:port` and, when a username is configured, logs in
    /// before handing the session out.
    pub async fn connect(settings: &BrokerSettings, mode: Mode) -> Result<Self, DriverError> {
        let url = format!("ws://{}:{}", settings.host, settings.port);
        let (socket, _) = time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| DriverError::Connection(format!("{url}: timed out")))?
            .map_err(|e| DriverError::Connection(format!("{url}: {e}")))?;
        let (mut sink, mut reader) = socket.split();

        if let Some(username) = &settings.username {
            let password = settings.password.as_deref().unwrap_or_default();
            time::timeout(
                HANDSHAKE_TIMEOUT,
                authenticate(&mut sink, &mut reader, username, password),
            )
            .await
            .map_err(|_| DriverError::Connection("timed out waiting for login".into()))??;
            info!(%username, "authenticated with popsub server");
        }

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            sink,
            outgoing_rx,
            outcomes_tx,
            settings.destination.clone(),
        ));

        let (reader, watcher) = match mode {
            Mode::Producer => (None, Some(tokio::spawn(watch_server(reader)))),
            Mode::Consumer => (Some(reader), None),
        };

        Ok(Self {
            destination: settings.destination.clone(),
            mode,
            outgoing: Some(outgoing_tx),
            reader,
            writer: Some(writer),
            watcher,
            outcomes_rx: Some(outcomes_rx),
            subscribed: false,
            closed: false,
        })
    }

    fn queue(&self, message: ClientMessage, receipt: Option<PendingSend>) -> Result<(), String> {
        let outgoing = self.outgoing.as_ref().ok_or("session is closed")?;
        let frame = message.to_frame().map_err(|e| e.to_string())?;
        outgoing
            .send(Outgoing { frame, receipt })
            .map_err(|_| "connection writer has stopped".to_string())
    }
}

async fn authenticate(
    sink: &mut WsWriter,
    reader: &mut WsReader,
    username: &str,
    password: &str,
) -> Result<(), DriverError> {
    let login = ClientMessage::Login {
        username: username.to_string(),
        password: password.to_string(),
    };
    send_frame(sink, &login).await?;

    let token = match next_server_message(reader).await? {
        ServerMessage::LoginResponse { token } => token,
        ServerMessage::Error { message } => {
            return Err(DriverError::Connection(format!("login rejected: {message}")));
        }
        other => {
            return Err(DriverError::Connection(format!(
                "unexpected reply to login: {other:?}"
            )));
        }
    };

    send_frame(sink, &ClientMessage::Auth { token }).await?;
    match next_server_message(reader).await? {
        ServerMessage::Authenticated {} => Ok(()),
        ServerMessage::Error { message } => Err(DriverError::Connection(format!(
            "authentication rejected: {message}"
        ))),
        other => Err(DriverError::Connection(format!(
            "unexpected reply to auth: {other:?}"
        ))),
    }
}

async fn send_frame(sink: &mut WsWriter, message: &ClientMessage) -> Result<(), DriverError> {
    let frame = message
        .to_frame()
        .map_err(|e| DriverError::Connection(e.to_string()))?;
    sink.send(frame)
        .await
        .map_err(|e| DriverError::Connection(e.to_string()))
}

async fn next_server_message(reader: &mut WsReader) -> Result<ServerMessage, DriverError> {
    while let Some(frame) = reader.next().await {
        let frame = frame.map_err(|e| DriverError::Connection(e.to_string()))?;
        match frame {
            WsMessage::Text(text) => {
                return ServerMessage::parse(text.as_str())
                    .map_err(|e| DriverError::Connection(format!("malformed server frame: {e}")));
            }
            WsMessage::Close(_) => break,
            _ => continue,
        }
    }
    Err(DriverError::Connection(
        "server closed the connection during login".into(),
    ))
}

async fn run_writer(
    mut sink: WsWriter,
    mut outgoing: UnboundedReceiver<Outgoing>,
    outcomes: UnboundedSender<DeliveryOutcome>,
    destination: String,
) {
    while let Some(Outgoing { frame, receipt }) = outgoing.recv().await {
        let result = sink.send(frame).await;
        if let Err(error) = &result {
            warn!(%error, "websocket write failed");
        }
        if let Some(PendingSend { id, payload_len }) = receipt {
            let outcome = match result {
                Ok(()) => DeliveryOutcome::delivered(id, &destination, payload_len),
                Err(e) => DeliveryOutcome::failed(id, &destination, payload_len, e.to_string()),
            };
            let _ = outcomes.send(outcome);
        }
    }

    if let Err(error) = sink.close().await {
        debug!(%error, "websocket close handshake failed");
    }
    debug!("websocket writer stopped");
}

/// Drains what the server sends a producer until the connection closes and
/// returns how many `error` frames it saw.
pub(crate) async fn watch_server(mut reader: WsReader) -> usize {
    let mut rejected = 0;
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match ServerMessage::parse(text.as_str()) {
                Ok(ServerMessage::Error { message }) => {
                    rejected += 1;
                    warn!(%message, "server rejected a request");
                }
                Ok(other) => debug!(?other, "ignoring server frame"),
                Err(error) => warn!(%error, "malformed server frame"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                debug!(%error, "server connection failed");
                break;
            }
        }
    }
    rejected
}

enum Inbound {
    Message(InboundMessage),
    Failure(ReceiveError),
    Ended(ReceiveError),
    Skip,
}

fn classify(frame: WsMessage, acks: &WeakUnboundedSender<Outgoing>) -> Inbound {
    let text = match frame {
        WsMessage::Text(text) => text,
        WsMessage::Close(_) => {
            return Inbound::Ended(ReceiveError::fatal("server closed the connection"));
        }
        _ => return Inbound::Skip,
    };

    match ServerMessage::parse(text.as_str()) {
        Ok(ServerMessage::Message {
            payload,
            message_id,
            qos,
            ..
        }) => {
            if qos > 0 {
                acknowledge(acks, message_id);
            }
            Inbound::Message(InboundMessage::new(payload.into_bytes()))
        }
        Ok(ServerMessage::Error { message }) => Inbound::Failure(ReceiveError::recoverable(message)),
        Ok(_) => Inbound::Skip,
        Err(e) => Inbound::Failure(ReceiveError::recoverable(format!(
            "malformed server frame: {e}"
        ))),
    }
}

fn acknowledge(acks: &WeakUnboundedSender<Outgoing>, message_id: String) {
    let Some(tx) = acks.upgrade() else {
        return;
    };
    match (ClientMessage::Ack { message_id }).to_frame() {
        Ok(frame) => {
            let _ = tx.send(Outgoing {
                frame,
                receipt: None,
            });
        }
        Err(error) => warn!(%error, "failed to encode ack"),
    }
}

#[async_trait]
impl Session for WebSocketSession {
    fn destination(&self) -> &str {
        &self.destination
    }

    /// Topics exist on first subscription in popsub, so only consumers have
    /// anything to declare.
    async fn declare_destination(&mut self, name: &str) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if self.mode == Mode::Producer || self.subscribed {
            return Ok(());
        }

        self.queue(
            ClientMessage::Subscribe {
                topic: name.to_string(),
            },
            None,
        )
        .map_err(|reason| DriverError::Declaration {
            destination: name.to_string(),
            reason,
        })?;
        self.subscribed = true;
        debug!(topic = name, "subscribe sent");
        Ok(())
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<SendReceipt, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }

        let id = new_message_id();
        let payload_len = payload.len();
        let publish = ClientMessage::Publish {
            topic: self.destination.clone(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            message_id: Some(id.clone()),
            qos: Some(0),
        };
        self.queue(
            publish,
            Some(PendingSend {
                id: id.clone(),
                payload_len,
            }),
        )
        .map_err(DriverError::Send)?;
        Ok(SendReceipt::Pending(id))
    }

    fn take_outcomes(&mut self) -> Option<OutcomeStream> {
        self.outcomes_rx.take()
    }

    async fn receive(&mut self) -> Result<InboundStream, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if self.mode == Mode::Producer {
            return Err(DriverError::Unsupported("receiving on a producer connection"));
        }
        let reader = self
            .reader
            .take()
            .ok_or_else(|| DriverError::Receive("receive stream already started".into()))?;
        let acks = self
            .outgoing
            .as_ref()
            .map(UnboundedSender::downgrade)
            .ok_or(DriverError::Closed)?;

        let inbound = stream::unfold(Some(reader), move |state| {
            let acks = acks.clone();
            async move {
                let mut reader = state?;
                loop {
                    let item = match reader.next().await {
                        Some(Ok(frame)) => classify(frame, &acks),
                        Some(Err(e)) => {
                            Inbound::Ended(ReceiveError::fatal(format!("websocket error: {e}")))
                        }
                        None => Inbound::Ended(ReceiveError::fatal("connection closed")),
                    };
                    match item {
                        Inbound::Message(message) => return Some((Ok(message), Some(reader))),
                        Inbound::Failure(error) => return Some((Err(error), Some(reader))),
                        Inbound::Ended(error) => return Some((Err(error), None)),
                        Inbound::Skip => continue,
                    }
                }
            }
        });
        Ok(inbound.boxed())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.subscribed {
            let unsubscribe = ClientMessage::Unsubscribe {
                topic: self.destination.clone(),
            };
            if let Err(reason) = self.queue(unsubscribe, None) {
                debug!(%reason, "could not unsubscribe");
            }
        }

        // The writer flushes what is queued, then closes the socket.
        self.outgoing.take();
        self.reader.take();
        if let Some(mut writer) = self.writer.take() {
            if time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                warn!("websocket writer did not stop in time");
                writer.abort();
            }
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        debug!(topic = %self.destination, "websocket session closed");
    }
}
