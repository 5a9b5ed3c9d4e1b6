use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::client::shutdown::MAX_POLL_INTERVAL;

/// Top-level configuration settings for the application.
///
/// Includes settings for both the broker connection and the client itself.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub app: AppSettings,
}

/// Which driver carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-process broker, useful for dry runs.
    Memory,
    /// popsub JSON protocol over WebSocket.
    #[default]
    Websocket,
    /// RabbitMQ via AMQP 0-9-1 (cargo feature `amqp`).
    Amqp,
    /// Kafka (cargo feature `kafka`).
    Kafka,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Memory => "memory",
            DriverKind::Websocket => "websocket",
            DriverKind::Amqp => "amqp",
            DriverKind::Kafka => "kafka",
        };
        f.write_str(name)
    }
}

/// Connection parameters for the broker and the destination to bind.
#[derive(Clone)]
pub struct BrokerSettings {
    pub kind: DriverKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic or queue name.
    pub destination: String,
    /// Consumer group, only used by the Kafka driver.
    pub group_id: String,
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("destination", &self.destination)
            .field("group_id", &self.group_id)
            .finish()
    }
}

/// Client behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub debug: bool,
    pub drain_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl AppSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            debug: false,
            drain_timeout_secs: 5,
            poll_interval_ms: MAX_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

pub const DEFAULT_GROUP_ID: &str = "async-broker-consumer";

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; `Settings::from_partial` fills defaults and
/// rejects missing required values.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub app: Option<PartialAppSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub kind: Option<DriverKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub destination: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialAppSettings {
    pub debug: Option<bool>,
    pub drain_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}
