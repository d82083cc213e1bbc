//! Logging initialisation for vmwarden embedders.
//!
//! Library code only emits `tracing` events; nothing is installed unless the
//! embedding binary calls [`init`]. That installs a stderr subscriber
//! filtered by `RUST_LOG` (default `vmwarden=info`) and, when the
//! `VMWARDEN_LOG` environment variable is set to `1`, tees structured lines
//! into `vmwarden.log` under the platform data directory.

use std::io;
use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "VMWARDEN_LOG";
const LOG_FILE: &str = "vmwarden.log";

/// Keeps the background log writer alive; dropping it flushes buffered
/// lines.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global tracing subscriber. Call once from the embedding
/// binary's `main` and hold the returned guard until exit.
pub fn init() -> LogGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmwarden=info"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    let (file_layer, file_guard) = match file_log_dir() {
        Some(dir) => {
            let _ = std::fs::create_dir_all(&dir);
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

/// Where to write the log file, or `None` when file logging is not
/// requested.
fn file_log_dir() -> Option<PathBuf> {
    if std::env::var(LOG_ENV).as_deref() != Ok("1") {
        return None;
    }
    Some(data_dir().unwrap_or_else(std::env::temp_dir))
}

fn data_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg).join("vmwarden"));
    }
    let home = PathBuf::from(std::env::var("HOME").ok()?);
    let base = if cfg!(target_os = "macos") {
        home.join("Library").join("Logs")
    } else {
        home.join(".local").join("share")
    };
    Some(base.join("vmwarden"))
}
