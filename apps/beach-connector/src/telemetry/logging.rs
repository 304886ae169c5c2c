use clap::ValueEnum;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const FILTER_ENV: &str = "BEACH_CONNECTOR_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "BEACH_CONNECTOR_TRACE_DEPS";

#[derive(
    Clone, Copy, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Line format of emitted events. `json` suits log shippers on headless hosts.
#[derive(Clone, Copy, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Append-mode log file; stderr when unset.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());
    let (writer, guard, colour) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (writer, guard, false)
        }
        None => {
            let colour = std::io::stderr().is_terminal();
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, colour)
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(writer);
    let installed = match config.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(builder.with_ansi(colour).finish())
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            builder.json().flatten_event(true).with_ansi(false).finish(),
        ),
    };
    installed.map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(
        target: "connector::telemetry",
        level = config.level.as_str(),
        format = ?config.format,
        file = ?config.file,
        "logging initialised"
    );
    if throttled_deps {
        tracing::debug!(
            target: "connector::telemetry",
            "suppressing dependency trace noise; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
        );
    }
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var(FILTER_ENV) {
        return (EnvFilter::new(filter), false);
    }
    let throttle = level == LevelFilter::TRACE
        && !super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false);
    (EnvFilter::new(default_filter_for(level, throttle)), throttle)
}

const TRACE_DEP_TARGETS: &[&str] = &["tokio_tungstenite", "tungstenite", "native_tls", "mio"];

fn default_filter_for(level: LevelFilter, throttle_deps: bool) -> String {
    let base = match level {
        LevelFilter::TRACE => "info,connector=trace,beach_connector=trace",
        LevelFilter::DEBUG => "info,connector=debug,beach_connector=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    let mut filter = base.to_owned();
    if throttle_deps {
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
    }
    filter
}
