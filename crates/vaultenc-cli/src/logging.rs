//! Tracing subscriber setup. One-shot commands get the verbosity-driven text format
//! below; the long-running `watch` service additionally honors `logging.format` and
//! `logging.output` from the loaded configuration.

use std::io;

use tracing_subscriber::EnvFilter;
use vaultenc_core::config::{Config, LogFormat, LogLevel};

fn filter_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Text output to stderr, level chosen by `-v` count. Used by every one-shot command.
pub fn init(verbose: u8) {
    let filter = filter_for(verbose);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Error => "error",
    }
}

/// Text or JSON output, to stderr or a file, as configured for the `watch` service.
/// `-v` still raises the floor set by `logging.level`, never lowers it.
pub fn init_from_config(config: &Config, verbose: u8) {
    let configured = level_str(config.logging.level);
    let filter = if verbose > 0 { filter_for(verbose) } else { configured };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let file = config.logging.output.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("warning: could not open log file {}: {e}, falling back to stderr", path.display()))
            .ok()
    });

    match (config.logging.format, file) {
        (LogFormat::Json, Some(file)) => {
            tracing_subscriber::fmt().json().with_env_filter(env_filter).with_writer(move || file.try_clone().expect("log file clone")).init();
        }
        (LogFormat::Json, None) => {
            tracing_subscriber::fmt().json().with_env_filter(env_filter).with_writer(io::stderr).init();
        }
        (LogFormat::Text, Some(file)) => {
            tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(move || file.try_clone().expect("log file clone")).init();
        }
        (LogFormat::Text, None) => {
            tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(io::stderr).init();
        }
    }
}
