use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "RUBRICD_LOG";

/// Installs the stderr subscriber. Stdout carries IPC responses and must
/// stay clean.
///
/// The filter comes from `RUBRICD_LOG`, then `RUST_LOG`, then `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}

pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
