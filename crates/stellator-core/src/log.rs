//! Logging bootstrap
//!
//! All crates in the workspace log through the `tracing` macros. This module
//! installs the process-wide `tracing-subscriber` formatter.
//!
//! # Environment Variables
//!
//! - `STELLATOR_LOG=<directives>` - full `EnvFilter` directive string,
//!   e.g. `stellator_runtime=debug,info`
//! - `STELLATOR_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!   (names are accepted too). Used when `STELLATOR_LOG` is unset.
//! - `STELLATOR_LOG_ANSI=on|off` - colored output; defaults to on when
//!   stdout is a terminal

use crate::env::{env_get_bool, env_get_opt};
use std::io::{self, IsTerminal};
use std::sync::Once;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install the global subscriber. Safe to call any number of times; only the
/// first call has an effect, and an already-installed foreign subscriber is
/// left in place.
pub fn init() {
    INIT.call_once(|| {
        let _ = fmt()
            .with_env_filter(filter_from_env())
            .with_ansi(ansi_from_env())
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(false)
            .compact()
            .try_init();
    });
}

/// Parse a level the way `STELLATOR_LOG_LEVEL` accepts it.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_lowercase().as_str() {
        "off" | "0" => Some(LevelFilter::OFF),
        "error" | "1" => Some(LevelFilter::ERROR),
        "warn" | "2" => Some(LevelFilter::WARN),
        "info" | "3" => Some(LevelFilter::INFO),
        "debug" | "4" => Some(LevelFilter::DEBUG),
        "trace" | "5" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

fn ansi_from_env() -> bool {
    env_get_bool("STELLATOR_LOG_ANSI", io::stdout().is_terminal())
}

fn filter_from_env() -> EnvFilter {
    if let Some(directives) = env_get_opt::<String>("STELLATOR_LOG") {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }
    let level = env_get_opt::<String>("STELLATOR_LOG_LEVEL")
        .and_then(|v| parse_level(&v))
        .unwrap_or(LevelFilter::INFO);
    EnvFilter::default().add_directive(level.into())
}
