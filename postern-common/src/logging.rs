//! Log setup and the logging macros used across the postern crates.

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Only events whose target starts with this are written
const TARGET_PREFIX: &str = "postern";

/// Emit an event at `$level` inside a span named `$span`.
///
/// [`internal!`](crate::internal) and [`outgoing!`](crate::outgoing) are the
/// usual entry points; this is what they expand to.
#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Log an event about the mail pipeline itself (startup, dispatch ticks, shutdown)
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Log an event about a message leaving through a transport
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// The level named by `requested`, or `default` when unset or unknown
fn parse_level(requested: Option<&str>, default: LevelFilter) -> Result<LevelFilter, String> {
    requested.map_or(Ok(default), |level| {
        LevelFilter::from_str(level.trim())
            .map_err(|_| level.to_string())
    })
}

fn is_postern_target(target: &str) -> bool {
    target.starts_with(TARGET_PREFIX)
}

/// Install the global subscriber.
///
/// The level comes from `LOG_LEVEL`, falling back to TRACE for debug builds
/// and INFO otherwise. Only events from `postern*` targets are emitted.
pub fn init() {
    let default = default_level();
    let requested = std::env::var("LOG_LEVEL").ok();

    let level = match parse_level(requested.as_deref(), default) {
        Ok(level) => level,
        Err(level) => {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        }
    };

    let targets = FilterFn::new(|metadata| is_postern_target(metadata.target()));

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(targets),
        )
        .init();
}
