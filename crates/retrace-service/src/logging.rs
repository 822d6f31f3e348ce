use std::env;

use tracing::level_filters::{LevelFilter, STATIC_MAX_LEVEL};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

use crate::config::{Config, LogFormat};

/// Crates whose logs follow the configured level. Everything else stays at `INFO`.
const RETRACE_CRATES: &[&str] = &["retrace", "retrace_service", "retrace_problems"];

/// Builds the default `RUST_LOG` directives for `level`.
fn default_directives(level: LevelFilter) -> String {
    let name = level.to_string().to_ascii_lowercase();
    if level <= LevelFilter::INFO {
        return name;
    }
    let mut directives = String::from("info");
    for krate in RETRACE_CRATES {
        directives.push_str(&format!(",{krate}={name}"));
    }
    directives
}

/// Installs the global tracing subscriber described by the `logging` section.
///
/// `RUST_LOG` takes precedence over the configured level.
///
/// # Safety
/// May set `RUST_BACKTRACE` with [`std::env::set_var`], so no other thread may be running.
pub unsafe fn init_logging(config: &Config) {
    let logging = &config.logging;
    if logging.enable_backtraces {
        // SAFETY: the caller guarantees that no other threads exist.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = match env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(default_directives(logging.level)),
    };

    let format = match logging.format {
        LogFormat::Auto if console::user_attended() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer().with_timer(UtcTime::rfc_3339());
    let layer = match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Auto | LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
}

/// Reports a fatal error through tracing, or on stderr if errors would not be logged.
pub fn ensure_log_error(error: &anyhow::Error) {
    let level = tracing::Level::ERROR;
    if level <= STATIC_MAX_LEVEL && level <= LevelFilter::current() {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
