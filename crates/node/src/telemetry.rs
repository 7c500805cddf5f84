//! Log subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the console subscriber
///
/// The filter comes from `RUST_LOG`; without it, `LOG_LEVEL` (default
/// `info`) applies to the tasklane crates.
pub fn init() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            Some(format!("tasklane_node={level},tasklane_manager={level}"))
        })
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}
