//! Subscriber setup for standalone use.
//!
//! An embedding application normally installs its own `tracing`
//! subscriber and this crate just emits into it. The helpers here cover
//! binaries and examples that have nobody else to do it: `init` installs
//! a subscriber with the crate's noise floor applied, and
//! `init_from_env` reads the filter from `EVENTMUX_LOG` and the output
//! shape from `EVENTMUX_LOG_STYLE`. A set `RUST_LOG` always wins over
//! both.

use std::env;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter spec, env_logger syntax. Example: `info,eventmux=debug`.
pub const FILTER_ENV: &str = "EVENTMUX_LOG";

/// One of `json`, `plain`, `verbose`.
pub const STYLE_ENV: &str = "EVENTMUX_LOG_STYLE";

/// Output shape of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    /// One JSON object per line, for log aggregation.
    Json,
    /// Single-line text without targets.
    #[default]
    Plain,
    /// Multi-line colored output for local debugging.
    Verbose,
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown log style '{0}', expected json, plain, or verbose")]
pub struct UnknownStyle(String);

impl FromStr for LogStyle {
    type Err = UnknownStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogStyle::Json),
            "plain" => Ok(LogStyle::Plain),
            "verbose" => Ok(LogStyle::Verbose),
            other => Err(UnknownStyle(other.to_string())),
        }
    }
}

/// The broker client and the HTTP stack flood debug level with frame and
/// connection-pool chatter; cap them at warn unless the spec says
/// otherwise.
const QUIET_DEPS: [&str; 3] = ["rumqttc=warn", "hyper=warn", "reqwest=warn"];

fn build_filter(spec: &str) -> EnvFilter {
    let mut filter = EnvFilter::new(spec);
    for directive in QUIET_DEPS {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install a global subscriber with the given filter spec and style.
pub fn init(spec: &str, style: LogStyle) {
    let filter = match env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) => build_filter(spec),
    };
    let registry = tracing_subscriber::registry().with(filter);
    match style {
        LogStyle::Json => registry.with(fmt::layer().json()).init(),
        LogStyle::Plain => registry
            .with(fmt::layer().compact().with_target(false))
            .init(),
        LogStyle::Verbose => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Install a global subscriber configured from the environment. Defaults
/// to `info` at the plain style.
pub fn init_from_env() {
    let spec = env::var(FILTER_ENV).unwrap_or_else(|_| "info".to_string());
    let style = env::var(STYLE_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    init(&spec, style);
}
