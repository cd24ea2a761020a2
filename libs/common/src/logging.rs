//! Logging setup for the services
//!
//! Console output uses `timestamp [LEVEL] message`. When a log directory is
//! configured the same lines also go to `<dir>/<service>.log`, rotated by
//! size and written from a background thread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Rotate once the active file would exceed this size
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;
/// Rotated files kept next to the active one
pub const DEFAULT_MAX_BACKUPS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("log directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter '{0}'")]
    Filter(String),

    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `2025-12-02T00:50:44.809123Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the background file writer alive for the life of the process
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Size-rotated log file
///
/// `service.log` is the active file; on rotation it becomes `service.log.1`,
/// older backups shift up and the oldest beyond `max_backups` is removed.
pub struct SizeRollingWriter {
    path: PathBuf,
    file: File,
    size: u64,
    max_file_size: u64,
    max_backups: usize,
}

impl SizeRollingWriter {
    pub fn new(path: impl Into<PathBuf>, max_file_size: u64, max_backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = open_append(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            size,
            max_file_size,
            max_backups,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.max_backups == 0 {
            self.file = File::create(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for SizeRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_file_size {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as filter target and log file name
    pub service_name: String,
    /// Level applied to the service crates when `RUST_LOG` is unset
    pub level: String,
    /// Directory for the log file; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Colored console output
    pub ansi: bool,
    pub max_file_size: u64,
    pub max_backups: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            ansi: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

/// Filter directives used when `RUST_LOG` is not set
///
/// Dependencies stay at `info` or quieter; the service and `common` follow
/// the configured level.
pub fn default_directives(service_name: &str, level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let base = match level.as_str() {
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        "off" => "off",
        _ => "info",
    };
    let level = match level.as_str() {
        "warning" => "warn",
        "critical" => "error",
        other => other,
    };
    format!("{base},{service_name}={level},common={level}")
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    let directives = match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => env,
        _ => default_directives(&config.service_name, &config.level),
    };
    EnvFilter::try_new(&directives).map_err(|_| LoggingError::Filter(directives))
}

/// Install the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config)?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            let path = dir.join(format!("{}.log", config.service_name));
            let writer = SizeRollingWriter::new(&path, config.max_file_size, config.max_backups)
                .map_err(|source| LoggingError::Io {
                    path: dir.clone(),
                    source,
                })?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            if GUARD.set(guard).is_err() {
                return Err(LoggingError::AlreadyInitialized(
                    "file writer guard already set".to_string(),
                ));
            }
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed(),
            )
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {}", config.service_name, dir.display()),
        None => tracing::debug!("Logging: {} (console)", config.service_name),
    }
    Ok(())
}
