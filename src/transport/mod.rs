//! The `transport` module defines the wire protocol spoken by the WebSocket
//! driver: the JSON frames a popsub server accepts and sends back.

pub mod message;

pub use message::{ClientMessage, ServerMessage};
