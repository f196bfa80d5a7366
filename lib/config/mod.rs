use std::env;
use std::net::{AddrParseError, SocketAddr};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::bili_source::BiliEndpoints;
use crate::cli::HarvestArgs;
use crate::fetch_client::FetchPolicy;
use crate::pipeline::types::{PictureDirs, PipelineConfig};

pub const DEFAULT_API_URL: &str = "https://api.bilibili.com/x/";
pub const DEFAULT_VIDEO_URL: &str = "https://www.bilibili.com/video/";
pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("--proxy-url (or BILI_PROXY_URL) is required with --use-proxy")]
    MissingProxyUrl,

    #[error("invalid --metrics-bind address `{addr}`: {source}")]
    InvalidBind {
        addr: String,
        #[source]
        source: AddrParseError,
    },
}

/// Everything a run needs, resolved from flags with environment fallbacks.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub endpoints: BiliEndpoints,
    pub database_path: PathBuf,
    pub pipeline: PipelineConfig,
    pub fetch_policy: FetchPolicy,
    pub proxy_url: Option<String>,
    pub global_rps: Option<NonZeroU32>,
    pub metrics_bind: Option<SocketAddr>,
    pub user_agents_file: Option<PathBuf>,
    pub ip_prefixes_file: Option<PathBuf>,
}

impl HarvestConfig {
    pub fn resolve(args: &HarvestArgs) -> Result<Self, ConfigError> {
        Self::resolve_with(args, |key| env::var(key).ok())
    }

    /// Resolves against an arbitrary variable lookup instead of the process environment.
    pub fn resolve_with<E>(args: &HarvestArgs, lookup: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        validate_harvest_args(args)?;

        let api_url = args
            .api_url
            .clone()
            .or_else(|| lookup("BILI_API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let video_url = args
            .video_url
            .clone()
            .or_else(|| lookup("BILI_VIDEO_URL"))
            .unwrap_or_else(|| DEFAULT_VIDEO_URL.to_string());
        let data_dir = args
            .data_dir
            .clone()
            .or_else(|| lookup("BILI_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let proxy_url = args
            .proxy_url
            .clone()
            .or_else(|| lookup("BILI_PROXY_URL"))
            .map(with_trailing_slash);
        if args.use_proxy && proxy_url.is_none() {
            return Err(ConfigError::MissingProxyUrl);
        }

        let metrics_bind = args
            .metrics_bind
            .as_deref()
            .map(parse_bind)
            .transpose()?;

        let mut pipeline =
            PipelineConfig::with_workers(args.workers, PictureDirs::under(&data_dir));
        pipeline.task_queue_capacity = args.queue_capacity;
        pipeline.start_page = args.start_page;
        pipeline.item_budget = (args.item_budget >= 0).then_some(args.item_budget);
        pipeline.poll_wait = Duration::from_millis(args.poll_wait_ms);
        pipeline.writer_interval = Duration::from_millis(args.writer_interval_ms);
        pipeline.status_interval = Duration::from_millis(args.status_interval_ms);
        pipeline.commit_every = args.commit_every;
        pipeline.max_image_dimension = args.max_image_dimension;

        let fetch_policy = FetchPolicy {
            use_proxy: args.use_proxy,
            allow_fallback: args.allow_fallback,
            allow_delete: args.allow_delete,
            max_attempts: args.fetch_attempts,
            timeout: Duration::from_millis(args.fetch_timeout_ms),
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            ..FetchPolicy::default()
        };

        Ok(Self {
            endpoints: BiliEndpoints {
                api_url: with_trailing_slash(api_url),
                video_url: with_trailing_slash(video_url),
                category_id: args.category_id,
            },
            database_path: data_dir.join(format!("{}.sqlite3", args.database_name)),
            pipeline,
            fetch_policy,
            proxy_url,
            global_rps: args.global_rps.and_then(NonZeroU32::new),
            metrics_bind,
            user_agents_file: args.user_agents_file.clone(),
            ip_prefixes_file: args.ip_prefixes_file.clone(),
        })
    }
}

pub fn validate_harvest_args(args: &HarvestArgs) -> Result<(), ConfigError> {
    let invalid = |message: String| Err(ConfigError::Invalid(message));

    if args.category_id <= 0 {
        return invalid(format!("--category-id must be > 0, got {}", args.category_id));
    }
    if args.start_page <= 0 {
        return invalid(format!("--start-page must be > 0, got {}", args.start_page));
    }
    if args.workers == 0 {
        return invalid("--workers must be > 0".to_string());
    }
    if args.queue_capacity == 0 {
        return invalid("--queue-capacity must be > 0".to_string());
    }
    if args.fetch_attempts == 0 {
        return invalid("--fetch-attempts must be > 0".to_string());
    }
    if args.fetch_timeout_ms == 0 {
        return invalid("--fetch-timeout-ms must be > 0".to_string());
    }
    if args.poll_wait_ms == 0 {
        return invalid("--poll-wait-ms must be > 0".to_string());
    }
    if args.writer_interval_ms == 0 {
        return invalid("--writer-interval-ms must be > 0".to_string());
    }
    if args.status_interval_ms == 0 {
        return invalid("--status-interval-ms must be > 0".to_string());
    }
    if args.commit_every == 0 {
        return invalid("--commit-every must be > 0".to_string());
    }
    if args.max_image_dimension == 0 {
        return invalid("--max-image-dimension must be > 0".to_string());
    }
    if args.global_rps == Some(0) {
        return invalid("--global-rps must be > 0".to_string());
    }
    if args.database_name.trim().is_empty() {
        return invalid("--database-name must not be empty".to_string());
    }
    if let Some(addr) = &args.metrics_bind {
        parse_bind(addr)?;
    }
    Ok(())
}

fn parse_bind(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse::<SocketAddr>()
        .map_err(|source| ConfigError::InvalidBind {
            addr: addr.to_string(),
            source,
        })
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}
