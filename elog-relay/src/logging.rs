use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogRotation, MetaConfig};

/// Maps the configured level (Python-style names are accepted) onto a
/// tracing filter directive.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

/// Installs the global subscriber: stderr always, plus a rotating file when
/// `log-file` is set. `RUST_LOG` takes precedence over `log-level`. The
/// returned guard flushes the file writer and must live until exit.
pub fn init(meta: &MetaConfig) -> Option<WorkerGuard> {
    let directive = level_directive(&meta.log_level);
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let terminal_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match &meta.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "elog-relay.log".to_string());

            let appender: RollingFileAppender = match meta.log_rotation {
                LogRotation::Daily => rolling::daily(directory, file_name),
                LogRotation::Hourly => rolling::hourly(directory, file_name),
                LogRotation::Never => rolling::never(directory, file_name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();
    guard
}
