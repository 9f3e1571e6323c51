//! Logging infrastructure for jobspawn.
//!
//! Provides consistent logging configuration for the orchestrator binary and
//! worker subprocesses, plus the severity tracker the orchestrator consumes
//! for its error-state classification.
//!
//! # Environment Variables
//!
//! - `JOBSPAWN_LOG` - Log filter (overrides RUST_LOG)
//! - `JOBSPAWN_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `JOBSPAWN_LOG_FORMAT` - Output format: pretty, compact, json
//! - `JOBSPAWN_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::collections::VecDeque;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::{Context, Layer, SubscriberExt},
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default for development)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation configuration for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    /// Rotate hourly
    Hourly,
    /// Rotate daily (default)
    #[default]
    Daily,
    /// Never rotate (single file)
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Log rotation for file output (default: Daily)
    pub rotation: LogRotation,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log file path.
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Set log rotation.
    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set a custom filter string.
    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence over environment variables: if a filter
    /// is already set (e.g., from --log-level), env vars won't override it.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("JOBSPAWN_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("JOBSPAWN_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("JOBSPAWN_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("JOBSPAWN_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Build the EnvFilter for this configuration.
    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Default capacity of the severity tracker's event buffer.
const SEVERITY_BUFFER_LEN: usize = 1000;

/// Tracks the worst log severity observed plus a bounded buffer of recent
/// warn/error events.
///
/// Attached to the subscriber as a [`Layer`] via [`SeverityTracker::layer`].
/// The orchestrator reads it for the error half of its state reporting and
/// resets it on reload.
pub struct SeverityTracker {
    // 0 = none, 1 = warn, 2 = error
    worst: AtomicU8,
    events: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl SeverityTracker {
    /// Create a tracker with the default buffer capacity.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(SEVERITY_BUFFER_LEN)
    }

    /// Create a tracker holding at most `capacity` recent events.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            worst: AtomicU8::new(0),
            events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        })
    }

    /// Build the subscriber layer feeding this tracker.
    pub fn layer(self: &Arc<Self>) -> SeverityLayer {
        SeverityLayer {
            tracker: Arc::clone(self),
        }
    }

    /// Worst severity observed since the last reset.
    pub fn worst(&self) -> Option<Level> {
        match self.worst.load(Ordering::Relaxed) {
            2 => Some(Level::ERROR),
            1 => Some(Level::WARN),
            _ => None,
        }
    }

    /// Number of buffered warn/error events since the last reset.
    pub fn count(&self) -> usize {
        self.events.lock().expect("severity buffer poisoned").len()
    }

    /// Return the `n`-th buffered event, oldest first.
    pub fn peek(&self, n: usize) -> Option<String> {
        self.events
            .lock()
            .expect("severity buffer poisoned")
            .get(n)
            .cloned()
    }

    /// Clear the buffer and reset the worst severity.
    pub fn reset(&self) {
        self.events.lock().expect("severity buffer poisoned").clear();
        self.worst.store(0, Ordering::Relaxed);
    }

    fn record(&self, level: Level, message: String) {
        let rank = if level == Level::ERROR { 2 } else { 1 };
        self.worst.fetch_max(rank, Ordering::Relaxed);

        let mut events = self.events.lock().expect("severity buffer poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(format!("{}: {}", level, message));
    }
}

/// Subscriber layer recording warn/error events into a [`SeverityTracker`].
pub struct SeverityLayer {
    tracker: Arc<SeverityTracker>,
}

impl<S: Subscriber> Layer<S> for SeverityLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .message
            .unwrap_or_else(|| event.metadata().name().to_string());
        self.tracker.record(level, message);
    }
}

/// Extracts the `message` field from an event.
#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and additionally to `config.file_path` when set (through a
/// dedicated writer thread; keep the returned guard alive until exit so the
/// file is flushed). Pass a [`SeverityTracker`] to feed the orchestrator's
/// error-state classification. Subsequent calls are silently ignored.
pub fn init(config: LogConfig, tracker: Option<&Arc<SeverityTracker>>) -> Option<WorkerGuard> {
    let filter = config.build_filter();
    let severity = tracker.map(|t| t.layer());

    let (file_layer, guard) = match config.file_path.as_ref() {
        Some(path) => {
            let parent = path.parent().unwrap_or(std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("jobspawn.log");
            let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_span_events(FmtSpan::NONE)
                .with_target(config.show_target)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = match config.format {
        LogFormat::Json => {
            let stderr_layer = fmt::layer()
                .json()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(severity)
                .with(file_layer)
                .with(stderr_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let stderr_layer = fmt::layer()
                .compact()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(severity)
                .with(file_layer)
                .with(stderr_layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(severity)
                .with(file_layer)
                .with(stderr_layer)
                .try_init()
        }
    };

    // Silently ignore if already initialized (idempotent)
    let _ = result;
    guard
}
