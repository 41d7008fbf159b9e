//! Logging setup for the `oppi` binary.
//!
//! `tracing` carries the structured events from the transport, command engine
//! and router; `env_logger` picks up the `log` records from the stores.

use std::io::{self, IsTerminal};
use std::str::FromStr;

use log::LevelFilter;

use crate::config::APP_NAME;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub quiet: bool,
    pub verbose: u8,
    pub debug: bool,
    pub trace: bool,
    pub json: bool,
    /// Level from the config file, used when no flag raises it.
    pub config_level: Option<String>,
}

impl LogOptions {
    pub fn effective_log_level(&self) -> LevelFilter {
        if self.trace {
            LevelFilter::Trace
        } else if self.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => self
                    .config_level
                    .as_deref()
                    .and_then(|level| LevelFilter::from_str(level).ok())
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

pub fn init_logging(options: &LogOptions) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if options.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = match options.effective_log_level() {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{APP_NAME}={level},oppi_client={level}"))
    });

    if options.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        let disable_color = std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_ansi(!disable_color),
            )
            .try_init()
            .ok();
    }

    // Also init env_logger for the log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(options.effective_log_level());
    builder.try_init().ok();
}
