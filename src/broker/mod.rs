//! In-process broker used by the memory driver.
//!
//! Keeps topics and their subscribers in memory and fans published messages
//! out over per-subscriber channels. Nothing is persisted.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::{Broker, PublishError, SharedBroker, Subscriber};

#[cfg(test)]
mod tests;
