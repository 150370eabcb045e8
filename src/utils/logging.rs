use tracing_subscriber::EnvFilter;

/// Initialize tracing for the binary and for tests that want log output.
///
/// `RUST_LOG` wins when it is set; otherwise `default_level` is used as the
/// filter (`"info"`, `"debug"`, `"mqdispatch=trace"`, ...). Uses `try_init`
/// so calling this more than once is harmless.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
