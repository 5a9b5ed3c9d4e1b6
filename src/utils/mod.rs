//! The `utils` module provides the pieces shared across `brokerctl`:
//! the error types and the logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{DriverError, ReceiveError, SettingsError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init(true, "info");
        logging::init(true, "debug");
        logging::init(false, "warn");
    }

    #[test]
    fn receive_error_constructors_set_fatality() {
        assert!(ReceiveError::fatal("gone").fatal);
        assert!(!ReceiveError::recoverable("hiccup").fatal);
        assert_eq!(ReceiveError::recoverable("hiccup").to_string(), "hiccup");
    }

    #[test]
    fn error_messages_name_the_problem() {
        assert_eq!(
            SettingsError::Missing("broker.host").to_string(),
            "missing required setting `broker.host`"
        );
        let err = DriverError::Declaration {
            destination: "orders".into(),
            reason: "access refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to declare destination `orders`: access refused"
        );
    }
}
