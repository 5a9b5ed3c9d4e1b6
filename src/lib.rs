//! # brokerctl
//!
//! `brokerctl` is an interactive command-line client for a message broker.
//! It either publishes each line typed on stdin to one destination, or prints
//! every message consumed from it, until the operator quits or the process
//! is signalled.
//!
//! ## Core Modules
//!
//! - `client`: The interactive session: input thread, dispatch loop, delivery tracking and shutdown.
//! - `driver`: The `Session` abstraction and its memory, WebSocket, AMQP and Kafka implementations.
//! - `broker`: The in-process topic engine behind the memory driver.
//! - `transport`: Wire frames of the popsub WebSocket protocol.
//! - `config`: Layered configuration from files, environment and secret files.
//! - `utils`: Shared utilities, such as error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod driver;
pub mod transport;
pub mod utils;
