use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "reloader=info";

/// Initialise the global tracing subscriber.
///
/// `log_json` switches from the human-readable format to one JSON object per
/// line, for piping the supervisor's own messages into other tools.
pub fn init(log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
