use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::Span;
use tracing_log::LogTracer;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::build_info;

pub const SERVICE_NAME: &str = "bili_harvester";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl LogFormat {
    /// `text` selects human-readable lines; anything else, or nothing, is JSON.
    pub fn from_setting(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "text" => Self::Text,
            _ => Self::Json,
        }
    }
}

/// Identity of one harvest run. Every event of the run is recorded inside [`run_span`].
///
/// [`run_span`]: LoggingContext::run_span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub run_id: String,
    pub environment: String,
    pub category_id: i64,
    pub database_path: PathBuf,
    pub format: LogFormat,
}

impl LoggingContext {
    /// Reads `APP_ENV` (or `ENVIRONMENT`) and `LOG_FORMAT` from the process environment.
    pub fn for_run(category_id: i64, database_path: &Path) -> Self {
        let environment = std::env::var("APP_ENV")
            .or_else(|_| std::env::var("ENVIRONMENT"))
            .unwrap_or_else(|_| "dev".to_string());
        let format = LogFormat::from_setting(std::env::var("LOG_FORMAT").ok().as_deref());
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();

        Self {
            run_id: harvest_run_id(category_id, started_at),
            environment,
            category_id,
            database_path: database_path.to_path_buf(),
            format,
        }
    }

    pub fn run_span(&self) -> Span {
        tracing::info_span!(
            "harvest_run",
            service = SERVICE_NAME,
            environment = %self.environment,
            run_id = %self.run_id,
            category_id = self.category_id,
            database = %self.database_path.display(),
            build_version = build_info::VERSION,
            build_commit = build_info::short_commit_hash()
        )
    }
}

fn harvest_run_id(category_id: i64, started_at_millis: u128) -> String {
    format!(
        "harvest-{category_id}-{}-{started_at_millis}",
        std::process::id()
    )
}

/// Installs the process-wide subscriber. `RUST_LOG` wins over `default_level` when set.
///
/// Later calls keep the first subscriber, so tests can initialize freely.
pub fn init_logging(context: &LoggingContext, default_level: &str) {
    let _ = LogTracer::init();

    let output: Box<dyn Layer<Registry> + Send + Sync> = match context.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init();

    tracing::info!(
        event = "logging_initialized",
        run_id = %context.run_id,
        category_id = context.category_id,
        log_format = ?context.format,
        "initialized logging"
    );
}

/// Renders `err`, each of its sources, and a backtrace for process-boundary logs.
pub fn format_error_report(err: &(dyn StdError + 'static)) -> String {
    let mut report = format!("error: {err}");
    for (depth, cause) in std::iter::successors(err.source(), |&cause| cause.source()).enumerate() {
        let _ = write!(report, "\ncaused by ({}): {cause}", depth + 1);
    }
    let _ = write!(report, "\nbacktrace:\n{}", Backtrace::force_capture());
    report
}
