use std::path::Path;

use muxwrap_engine::LogLevel;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::AppError;

/// Dependencies that are too chatty below warn.
const QUIET_DEPENDENCIES: &[&str] = &["hyper_util", "reqwest", "rustls"];

fn filter_for(level: LogLevel) -> EnvFilter {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return EnvFilter::from_default_env();
    }
    let Some(level) = level.tracing_directive() else {
        return EnvFilter::new("off");
    };
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|dep| format!("{dep}=warn")));
    EnvFilter::new(directives.join(","))
}

/// Log to stderr (stdout carries the stream) and optionally to a file.
/// The returned guard must be kept alive until exit to flush the file.
pub fn init_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, AppError> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                AppError::Initialization(format!("invalid log file path {}", path.display()))
            })?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_for(level))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    Ok(guard)
}
