use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the application.
///
/// Logging is gated by the debug flag: when `debug` is false no subscriber is
/// installed and every event is discarded. Otherwise `RUST_LOG` wins over
/// `default_level`. Output goes to stderr so it does not interleave with the
/// operator prompt on stdout.
pub fn init(debug: bool, default_level: &str) {
    if !debug {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));

    // Use try_init so tests and libraries can call this multiple times without panicking
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
