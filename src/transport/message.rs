//! Frames of the popsub WebSocket protocol, as JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth { token: String },
    #[serde(rename = "login")]
    Login { username: String, password: String },
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        payload: String,
        message_id: Option<String>,
        qos: Option<u8>,
    },
    #[serde(rename = "ack")]
    Ack { message_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "login_response")]
    LoginResponse { token: String },
    #[serde(rename = "authenticated")]
    Authenticated {},
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "message")]
    Message {
        topic: String,
        payload: String,
        timestamp: i64,
        message_id: String,
        qos: u8,
    },
}

impl ClientMessage {
    pub fn to_frame(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }
}

impl ServerMessage {
    pub fn to_frame(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
