mod settings;

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use config::{Config, Environment, File};

use crate::client::shutdown::MAX_POLL_INTERVAL;
use crate::utils::error::SettingsError;

pub use settings::{
    AppSettings, BrokerSettings, DEFAULT_GROUP_ID, DriverKind, PartialAppSettings,
    PartialBrokerSettings, PartialSettings, Settings,
};

/// Prefix of environment overrides, e.g. `BROKERCTL_BROKER__HOST`.
pub const ENV_PREFIX: &str = "BROKERCTL";

/// Upper bound on `app.drain_timeout_secs`.
pub const MAX_DRAIN_TIMEOUT_SECS: u64 = 3600;

/// Password files tried, in order, when none is configured.
const DEFAULT_PASSWORD_FILES: [&str; 2] = ["/run/secrets/broker_password", "./broker.txt"];

/// Loads the configuration from the default file, an optional explicit file
/// and environment variables, then validates it.
///
/// Sources, lowest precedence first: `config/default.*` (optional), `path`
/// (required when given), `BROKERCTL_<SECTION>__<KEY>` variables.
pub fn load_config(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Settings::from_partial(partial)
}

impl Settings {
    /// Merges partial settings with defaults and checks required values.
    pub fn from_partial(partial: PartialSettings) -> Result<Self, SettingsError> {
        let broker = partial.broker.unwrap_or_default();
        let app = partial.app.unwrap_or_default();
        let default_app = AppSettings::default();

        let host = required(broker.host, "broker.host")?;
        let port = broker.port.ok_or(SettingsError::Missing("broker.port"))?;
        let destination = required(broker.destination, "broker.destination")?;

        let password = match broker.password {
            Some(password) => Some(password),
            None => resolve_password_file(broker.password_file.as_deref())?,
        };

        let poll_interval_ms = app
            .poll_interval_ms
            .unwrap_or(default_app.poll_interval_ms);
        let max_poll_ms = MAX_POLL_INTERVAL.as_millis() as u64;
        if poll_interval_ms == 0 || poll_interval_ms > max_poll_ms {
            return Err(SettingsError::Invalid {
                key: "app.poll_interval_ms",
                reason: format!("must be between 1 and {max_poll_ms}, got {poll_interval_ms}"),
            });
        }

        let drain_timeout_secs = app
            .drain_timeout_secs
            .unwrap_or(default_app.drain_timeout_secs);
        if drain_timeout_secs > MAX_DRAIN_TIMEOUT_SECS {
            return Err(SettingsError::Invalid {
                key: "app.drain_timeout_secs",
                reason: format!(
                    "must be at most {MAX_DRAIN_TIMEOUT_SECS}, got {drain_timeout_secs}"
                ),
            });
        }

        Ok(Settings {
            broker: BrokerSettings {
                kind: broker.kind.unwrap_or_default(),
                host,
                port,
                username: broker.username.filter(|u| !u.is_empty()),
                password,
                destination,
                group_id: broker
                    .group_id
                    .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()),
            },
            app: AppSettings {
                debug: app.debug.unwrap_or(default_app.debug),
                drain_timeout_secs,
                poll_interval_ms,
            },
        })
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, SettingsError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(SettingsError::Missing(key))
}

/// Reads a base64 password from the configured file, or from the first
/// default location that exists.
fn resolve_password_file(configured: Option<&Path>) -> Result<Option<String>, SettingsError> {
    let path = match configured {
        Some(path) => path.to_path_buf(),
        None => match DEFAULT_PASSWORD_FILES
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
        {
            Some(path) => path,
            None => return Ok(None),
        },
    };

    read_password_file(&path).map(Some)
}

pub(crate) fn read_password_file(path: &Path) -> Result<String, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::PasswordFile {
        path: path.to_path_buf(),
        source,
    })?;

    let decoded = STANDARD
        .decode(raw.trim())
        .map_err(|e| SettingsError::PasswordDecode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    String::from_utf8(decoded).map_err(|e| SettingsError::PasswordDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests;
