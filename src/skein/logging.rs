use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::skein::config::LoggingConfig;

/// Keeps the non-blocking log writer alive. Dropping it flushes and stops the
/// background worker, so it must live for the whole process.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    // RUST_LOG wins; otherwise the configured level is used as the directive,
    // so `level = "skein=debug"` works as well as plain `"info"`.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cfg.level.trim()))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(cfg.output.trim())?;
    let json = cfg.format.trim().eq_ignore_ascii_case("json");

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    let fmt_layer = if json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let pair = match output {
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "discard" => tracing_appender::non_blocking(io::sink()),
        path => tracing_appender::non_blocking(open_log_file(Path::new(path))?),
    };
    Ok(pair)
}

fn open_log_file(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("logging: mkdir {}", parent.display()))?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("logging: open {}", path.display()))
}
