use tracing_subscriber::EnvFilter;

use crate::core::config::{LogFormat, ServiceSettings};

/// Install the global subscriber. `RUST_LOG` overrides the default `info` level.
/// Log lines go to stderr so stdout stays free for the CLI banner and guides.
pub(crate) fn init(service: &ServiceSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second init (tests, restarts) keeps the first subscriber.
    match service.log_format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .try_init()
            .ok(),
        LogFormat::Pretty => builder.try_init().ok(),
    };

    tracing::info!(
        service = %service.name,
        env = %service.env,
        format = ?service.log_format,
        "Logging initialised"
    );
}
