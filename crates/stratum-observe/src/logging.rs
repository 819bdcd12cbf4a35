//! Structured logging setup.

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Log output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (for development).
    Pretty,
    /// Compact format without colors.
    Compact,
    /// JSON format (for production).
    Json,
}

#[allow(clippy::derivable_impls)]
impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        {
            LogFormat::Pretty
        }
        #[cfg(not(debug_assertions))]
        {
            LogFormat::Json
        }
    }
}

/// Configuration for logging behavior.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Whether to include file/line numbers.
    pub include_location: bool,
    /// Whether to include the target module.
    pub include_target: bool,
    /// Whether to log span events (enter/exit/close).
    pub log_spans: bool,
    /// Environment filter (e.g. `info,stratum=debug`).
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            include_location: cfg!(debug_assertions),
            include_target: true,
            log_spans: false,
            filter: None,
        }
    }
}

/// Initializes the global tracing subscriber. Fails if one is already
/// installed.
pub fn init_logging(config: LogConfig) -> anyhow::Result<()> {
    let env_filter = if let Some(filter) = config.filter {
        EnvFilter::try_new(filter)?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,stratum=debug"))
    };

    let fmt_span = if config.log_spans { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(fmt_span);

    match config.format {
        LogFormat::Pretty => subscriber
            .pretty()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize pretty logger: {err}"))?,
        LogFormat::Compact => subscriber
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize compact logger: {err}"))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    tracing::info!(format = ?config.format, "logging initialized");
    Ok(())
}
