use super::*;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

fn minimal_broker() -> PartialBrokerSettings {
    PartialBrokerSettings {
        host: Some("localhost".to_string()),
        port: Some(5672),
        destination: Some("orders".to_string()),
        ..Default::default()
    }
}

fn partial(broker: PartialBrokerSettings) -> PartialSettings {
    PartialSettings {
        broker: Some(broker),
        app: None,
    }
}

#[test]
fn test_default_app_settings() {
    let app = AppSettings::default();
    assert!(!app.debug);
    assert_eq!(app.drain_timeout_secs, 5);
    assert_eq!(app.poll_interval_ms, 500);
    assert_eq!(app.poll_interval(), MAX_POLL_INTERVAL);
}

#[test]
fn test_from_partial_fills_defaults() {
    let settings = Settings::from_partial(partial(minimal_broker())).unwrap();
    assert_eq!(settings.broker.kind, DriverKind::Websocket);
    assert_eq!(settings.broker.host, "localhost");
    assert_eq!(settings.broker.port, 5672);
    assert_eq!(settings.broker.destination, "orders");
    assert_eq!(settings.broker.group_id, DEFAULT_GROUP_ID);
    assert_eq!(settings.app, AppSettings::default());
}

#[test]
fn test_missing_required_fields_are_reported() {
    let mut broker = minimal_broker();
    broker.host = None;
    let err = Settings::from_partial(partial(broker)).unwrap_err();
    assert!(matches!(err, SettingsError::Missing("broker.host")));

    let mut broker = minimal_broker();
    broker.port = None;
    let err = Settings::from_partial(partial(broker)).unwrap_err();
    assert!(matches!(err, SettingsError::Missing("broker.port")));

    let mut broker = minimal_broker();
    broker.destination = Some("   ".to_string());
    let err = Settings::from_partial(partial(broker)).unwrap_err();
    assert!(matches!(err, SettingsError::Missing("broker.destination")));

    let err = Settings::from_partial(PartialSettings::default()).unwrap_err();
    assert!(matches!(err, SettingsError::Missing(_)));
}

#[test]
fn test_poll_interval_is_bounded() {
    for bad in [0, 501, 10_000] {
        let mut settings = partial(minimal_broker());
        settings.app = Some(PartialAppSettings {
            poll_interval_ms: Some(bad),
            ..Default::default()
        });
        let err = Settings::from_partial(settings).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid {
                key: "app.poll_interval_ms",
                ..
            }
        ));
    }
}

#[test]
fn test_drain_timeout_is_bounded() {
    for bad in [MAX_DRAIN_TIMEOUT_SECS + 1, u64::MAX] {
        let mut settings = partial(minimal_broker());
        settings.app = Some(PartialAppSettings {
            drain_timeout_secs: Some(bad),
            ..Default::default()
        });
        let err = Settings::from_partial(settings).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid {
                key: "app.drain_timeout_secs",
                ..
            }
        ));
    }

    let mut settings = partial(minimal_broker());
    settings.app = Some(PartialAppSettings {
        drain_timeout_secs: Some(MAX_DRAIN_TIMEOUT_SECS),
        ..Default::default()
    });
    let cfg = Settings::from_partial(settings).unwrap();
    assert_eq!(cfg.app.drain_timeout_secs, MAX_DRAIN_TIMEOUT_SECS);
}

#[test]
fn test_password_file_is_base64_decoded() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("broker.txt");
    fs::write(&path, "czNjcjN0\n").expect("write password file");

    let mut broker = minimal_broker();
    broker.password_file = Some(path);
    let settings = Settings::from_partial(partial(broker)).unwrap();
    assert_eq!(settings.broker.password.as_deref(), Some("s3cr3t"));
}

#[test]
fn test_inline_password_wins_over_file() {
    let mut broker = minimal_broker();
    broker.password = Some("inline".to_string());
    broker.password_file = Some("/definitely/not/here".into());
    let settings = Settings::from_partial(partial(broker)).unwrap();
    assert_eq!(settings.broker.password.as_deref(), Some("inline"));
}

#[test]
fn test_unreadable_or_invalid_password_file_is_fatal() {
    let mut broker = minimal_broker();
    broker.password_file = Some("/definitely/not/here".into());
    let err = Settings::from_partial(partial(broker)).unwrap_err();
    assert!(matches!(err, SettingsError::PasswordFile { .. }));

    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("broker.txt");
    fs::write(&path, "not base64 !!").expect("write password file");
    let mut broker = minimal_broker();
    broker.password_file = Some(path);
    let err = Settings::from_partial(partial(broker)).unwrap_err();
    assert!(matches!(err, SettingsError::PasswordDecode { .. }));
}

#[test]
fn test_debug_output_redacts_password() {
    let mut broker = minimal_broker();
    broker.password = Some("hunter2".to_string());
    let settings = Settings::from_partial(partial(broker)).unwrap();
    let printed = format!("{:?}", settings.broker);
    assert!(!printed.contains("hunter2"));
    assert!(printed.contains("<redacted>"));
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // Create a temporary directory and set it as current dir so load_config
    // will pick up config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        kind = "memory"
        host = "broker.internal"
        port = 9000
        destination = "audit"
        username = "guest"
        password = "guest"

        [app]
        debug = true
        drain_timeout_secs = 2
        poll_interval_ms = 100
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config(None);

    // restore cwd before asserting so a failure does not leak the tempdir cwd
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.kind, DriverKind::Memory);
    assert_eq!(cfg.broker.host, "broker.internal");
    assert_eq!(cfg.broker.port, 9000);
    assert_eq!(cfg.broker.destination, "audit");
    assert_eq!(cfg.broker.username.as_deref(), Some("guest"));
    assert!(cfg.app.debug);
    assert_eq!(cfg.app.drain_timeout_secs, 2);
    assert_eq!(cfg.app.poll_interval_ms, 100);
}

#[test]
#[serial]
fn load_config_reads_explicit_file_and_environment() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("client.toml");
    fs::write(
        &path,
        r#"
        [broker]
        host = "from-file"
        port = 5672
        destination = "orders"
        "#,
    )
    .expect("write config file");

    let cfg = temp_env::with_vars(
        [
            ("BROKERCTL_BROKER__HOST", Some("from-env")),
            ("BROKERCTL_BROKER__KIND", Some("kafka")),
            ("BROKERCTL_APP__DRAIN_TIMEOUT_SECS", Some("9")),
        ],
        || load_config(Some(&path)),
    )
    .expect("load_config failed");

    assert_eq!(cfg.broker.host, "from-env");
    assert_eq!(cfg.broker.kind, DriverKind::Kafka);
    assert_eq!(cfg.broker.port, 5672);
    assert_eq!(cfg.app.drain_timeout_secs, 9);
}

#[test]
#[serial]
fn load_config_requires_explicit_file_to_exist() {
    let err = load_config(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
    assert!(matches!(err, SettingsError::Source(_)));
}
