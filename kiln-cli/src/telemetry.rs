//! Log subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{CliError, CliResult};

/// Install the global subscriber.
///
/// Respects `RUST_LOG`, defaulting to `kiln=info` and `warn` elsewhere. Set `KILN_LOG_FORMAT=json`
/// for structured output. Logs go to stderr so stdout stays parseable.
pub fn init() -> CliResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kiln=info,kiln_storage=info,warn"));

    let json = std::env::var("KILN_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Telemetry(e.to_string()))
}
