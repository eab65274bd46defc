use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
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

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
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

    let filter = std::env::var("SHORELINE_LOG_FILTER")
        .unwrap_or_else(|_| default_filter_for(config.level.to_filter(), allow_dependency_traces()));

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

/// The media stack is chatty at trace level; keep it at info unless asked.
const TRACE_DEP_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "tokio_tungstenite",
    "tungstenite",
];

fn allow_dependency_traces() -> bool {
    std::env::var("SHORELINE_TRACE_DEPS")
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}

fn default_filter_for(level: LevelFilter, dependency_traces: bool) -> String {
    let mut filter = match level {
        LevelFilter::TRACE => "info,shoreline=trace,shoreline_client=trace,shoreline_proto=trace".to_owned(),
        LevelFilter::DEBUG => "info,shoreline=debug,shoreline_client=debug,shoreline_proto=debug".to_owned(),
        other => other.to_string().to_lowercase(),
    };
    if level == LevelFilter::TRACE && !dependency_traces {
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn filters_scale_with_level() {
        assert_eq!(default_filter_for(LevelFilter::WARN, false), "warn");
        assert_eq!(default_filter_for(LevelFilter::OFF, false), "off");
        assert!(default_filter_for(LevelFilter::DEBUG, false).contains("shoreline_client=debug"));

        let trace = default_filter_for(LevelFilter::TRACE, false);
        assert!(trace.contains("webrtc_ice=info"));
        assert!(!default_filter_for(LevelFilter::TRACE, true).contains("webrtc_ice=info"));
    }

    #[test_timeout::timeout]
    fn levels_are_ordered_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Debug);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
        assert_eq!(LogLevel::Info.to_filter(), LevelFilter::INFO);
    }
}
