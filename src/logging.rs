use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

fn stdout_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// JSON logs on stdout, filtered by `RUST_LOG` (default `info`). With a log
/// file configured, debug-level JSON goes there too. Keep the returned guard
/// alive or buffered file output is lost.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stdout = fmt::layer().json().with_filter(stdout_filter());

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(stdout)
            .try_init()
            .context("failed to install tracing subscriber")?;
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    let file = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(Some(guard))
}
