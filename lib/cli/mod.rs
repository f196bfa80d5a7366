use std::path::PathBuf;

use crate::build_info;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    about = "Crawls a video catalog listing, item details, pictures and comments into SQLite",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct HarvestArgs {
    #[arg(long = "api-url")]
    /// Prefix for the listing and comment APIs (env `BILI_API_URL`)
    pub api_url: Option<String>,
    #[arg(long = "video-url")]
    /// Prefix for item detail pages (env `BILI_VIDEO_URL`)
    pub video_url: Option<String>,
    #[arg(long = "data-dir")]
    /// Root for the database and picture directories (env `BILI_DATA_DIR`, default `data`)
    pub data_dir: Option<PathBuf>,
    #[arg(long = "database-name", default_value = "data")]
    /// Database file stem; the store lives at `<data-dir>/<name>.sqlite3`
    pub database_name: String,

    #[arg(long = "category-id")]
    /// Catalog category to enumerate
    pub category_id: i64,
    #[arg(long = "start-page", default_value_t = 1)]
    /// First listing page when the store has no checkpoint
    pub start_page: i64,
    #[arg(long = "item-budget", default_value_t = -1, allow_negative_numbers = true)]
    /// Total items to hold in the store; negative means unlimited
    pub item_budget: i64,

    #[arg(long = "workers", default_value_t = 1)]
    pub workers: usize,
    #[arg(long = "queue-capacity", default_value_t = 100)]
    pub queue_capacity: usize,

    #[arg(long = "use-proxy", default_value_t = false)]
    pub use_proxy: bool,
    #[arg(long = "proxy-url")]
    /// Proxy pool service prefix (env `BILI_PROXY_URL`); required with `--use-proxy`
    pub proxy_url: Option<String>,
    #[arg(long = "allow-fallback", default_value_t = false)]
    /// Fetch without a proxy when the pool has none instead of waiting
    pub allow_fallback: bool,
    #[arg(long = "allow-delete", default_value_t = false)]
    /// Report proxies that exhaust a request's attempts back to the pool
    pub allow_delete: bool,
    #[arg(long = "user-agents-file")]
    /// JSON array of user agents replacing the built-in list
    pub user_agents_file: Option<PathBuf>,
    #[arg(long = "ip-prefixes-file")]
    /// JSON array of regional IP prefixes replacing the built-in list
    pub ip_prefixes_file: Option<PathBuf>,

    #[arg(long = "fetch-attempts", default_value_t = 3)]
    pub fetch_attempts: u32,
    #[arg(long = "fetch-timeout-ms", default_value_t = 3000)]
    pub fetch_timeout_ms: u64,
    #[arg(long = "retry-backoff-ms", default_value_t = 1000)]
    pub retry_backoff_ms: u64,
    #[arg(long = "global-rps")]
    /// Optional request budget shared by every worker
    pub global_rps: Option<u32>,

    #[arg(long = "poll-wait-ms", default_value_t = 5000)]
    pub poll_wait_ms: u64,
    #[arg(long = "writer-interval-ms", default_value_t = 5000)]
    pub writer_interval_ms: u64,
    #[arg(long = "status-interval-ms", default_value_t = 10000)]
    pub status_interval_ms: u64,
    #[arg(long = "commit-every", default_value_t = 100)]
    pub commit_every: usize,
    #[arg(long = "max-image-dimension", default_value_t = 16384)]
    pub max_image_dimension: u32,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    #[arg(long = "metrics-bind")]
    /// Serve `/health` and `/metrics` on this address
    pub metrics_bind: Option<String>,
}

pub fn parse_args() -> HarvestArgs {
    HarvestArgs::parse()
}
