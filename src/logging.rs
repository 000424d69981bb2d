//! Logging configuration with journald support on Linux.
//!
//! Logs go to systemd's journal on Linux when it is reachable, otherwise to a
//! daily rolling file. Command output itself is printed to stdout by the
//! binary and never goes through here.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "FACESTORE_LOG";

/// Initialize the logging system. Call once at startup.
///
/// Log level can be controlled via the `FACESTORE_LOG` environment variable:
/// - `FACESTORE_LOG=debug` for every write the store makes
/// - `FACESTORE_LOG=info` for open, migrate, clear and export (default)
/// - `FACESTORE_LOG=warn` for rejected destructive calls and failed tasks only
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier("facestore".to_string()))
                .try_init()
                .context("Failed to install journald subscriber")?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    // Fallback to file-based logging
    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "facestore.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer thread alive for the life of the process
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .context("Failed to install file subscriber")?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facestore")
        .join("logs")
}
