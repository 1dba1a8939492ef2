//! Logging setup. Logs go to stderr so stdout stays clean for the
//! wallet/balance/transaction reports.

use tracing_subscriber::{fmt, EnvFilter};

/// Env var that switches log output to JSON lines.
pub const LOG_JSON_ENV: &str = "FORWARDER_LOG_JSON";

const DEFAULT_FILTER: &str = "info";

pub fn init_logging() {
    let use_json = std::env::var(LOG_JSON_ENV).map(|value| value == "1").unwrap_or(false);
    init_logging_with(use_json);
}

/// `RUST_LOG` wins over the default `info` filter. Safe to call twice; the
/// second call is a no-op.
pub fn init_logging_with(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
