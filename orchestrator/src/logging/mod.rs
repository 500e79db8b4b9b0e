//! Logging setup
//!
//! Pretty output on a terminal with a JSON copy in the log directory;
//! JSON to both stdout and the log file otherwise.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE: &str = "runtime-manager.log";

fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging/tracing system
pub fn init_logging(log_level: &str, log_dir: &Path) -> Result<()> {
    let level = parse_level(log_level);

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("runtime_manager={level},tower_http={level}"))
    });

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))
        .context("Failed to open log file")?;

    if atty::is(atty::Stream::Stdout) {
        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .pretty()
            .with_writer(std::io::stdout);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .with_writer(log_file.and(std::io::stderr.with_max_level(Level::ERROR)));

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_writer(log_file.and(std::io::stdout));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Check if stdout is a terminal
mod atty {
    pub enum Stream {
        Stdout,
    }

    pub fn is(stream: Stream) -> bool {
        let fd = match stream {
            Stream::Stdout => 1,
        };
        #[cfg(unix)]
        {
            unsafe { libc::isatty(fd) != 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = fd;
            false
        }
    }
}
