//! The `error` module defines the error types used within `brokerctl`.
//!
//! Startup failures (`SettingsError`, `DriverError` raised while connecting or
//! declaring) end the process. Per-message failures are reported and the
//! session keeps running; `ReceiveError` carries whether the driver considers
//! the failure recoverable.

use std::path::PathBuf;

use thiserror::Error;

/// Problems found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read password file {}: {source}", path.display())]
    PasswordFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("password file {} is not valid base64: {reason}", path.display())]
    PasswordDecode { path: PathBuf, reason: String },
}

/// Failures surfaced by a broker driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("failed to declare destination `{destination}`: {reason}")]
    Declaration { destination: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("failed to start receiving: {0}")]
    Receive(String),

    #[error("{0} is not supported by this session")]
    Unsupported(&'static str),

    #[error("session is closed")]
    Closed,
}

/// A single failure read from a driver's receive stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ReceiveError {
    pub message: String,
    pub fatal: bool,
}

impl ReceiveError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// Anything that stops the client before the dispatch loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("failed to start input thread: {0}")]
    Input(#[from] std::io::Error),
}
