use warren::connection::OpenConnectionArguments;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// construct a subscriber that prints formatted traces to stdout
pub fn setup_logging() {
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A RabbitMQ on localhost with the default guest account.
pub fn build_conn_args() -> OpenConnectionArguments {
    OpenConnectionArguments::new("localhost", 5672, "guest", "guest")
}

/// Queue name unique to this test run.
pub fn unique_name(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("warren.{}.{}", prefix, nanos)
}
