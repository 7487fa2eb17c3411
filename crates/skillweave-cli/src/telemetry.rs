//! Logging initialization.
//!
//! Controlled by two environment variables:
//! - `SKILLWEAVE_LOG`: an `EnvFilter` directive (`info`, `skillweave=debug`,
//!   ...). Unset → `warn`.
//! - `SKILLWEAVE_LOG_FORMAT=json` → JSON events to stderr; anything else →
//!   human-readable lines to stderr.
//!
//! Stdout is reserved for command results.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Filter directive variable.
pub const LOG_ENV: &str = "SKILLWEAVE_LOG";

/// Output format variable.
pub const LOG_FORMAT_ENV: &str = "SKILLWEAVE_LOG_FORMAT";

/// Install the global subscriber. Call once, first thing in `main`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
    }
}
