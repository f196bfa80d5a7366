use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::db::{ItemRecord, OwnerRecord};
use crate::retry::RetryPolicy;

/// Remaining-budget value used when no item limit is configured.
pub const UNLIMITED_BUDGET: i64 = i64::MAX;

/// Seconds since the epoch, stamped on every ingested record.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

/// One item to fetch in detail, as emitted by the listing enumerator.
///
/// Immutable: a transient failure re-enqueues the exact same descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskDescriptor {
    pub item_id: i64,
    pub item_key: String,
    pub content_id: i64,
    /// Listing page the item was found on; the writer advances the checkpoint to it.
    pub page_number: i64,
}

/// One summary row of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub item_id: i64,
    pub item_key: String,
    pub content_id: i64,
}

impl ListingEntry {
    pub fn into_task(self, page_number: i64) -> TaskDescriptor {
        TaskDescriptor {
            item_id: self.item_id,
            item_key: self.item_key,
            content_id: self.content_id,
            page_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailOutcome {
    Found {
        item: ItemRecord,
        owner: OwnerRecord,
    },
    /// The source marks the item as deleted; the task is dropped.
    Deleted,
}

/// An item record on its way to the writer, tagged with its originating listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedItem {
    pub record: ItemRecord,
    pub page_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureKind {
    Item,
    Owner,
}

impl PictureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Owner => "owner",
        }
    }
}

/// Download of one cover or avatar. Queue-only; re-derived from the store on restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PictureJob {
    pub kind: PictureKind,
    pub subject_id: i64,
    pub remote_ref: String,
}

impl PictureJob {
    pub fn cover(item_id: i64, remote_ref: impl Into<String>) -> Self {
        Self {
            kind: PictureKind::Item,
            subject_id: item_id,
            remote_ref: remote_ref.into(),
        }
    }

    pub fn avatar(owner_id: i64, remote_ref: impl Into<String>) -> Self {
        Self {
            kind: PictureKind::Owner,
            subject_id: owner_id,
            remote_ref: remote_ref.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommentJob {
    pub item_id: i64,
}

/// First page of replies for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentPage {
    Replies(Vec<String>),
    /// The payload did not have the expected shape; stored as an empty message list.
    Degraded { reason: String },
}

/// Normalized fetch failure classes used by worker requeue logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Timeout, connection failure, bad status, incomplete body, no proxy before shutdown.
    Network,
    /// Downloaded picture failed to decode or exceeds the dimension bound.
    Integrity,
    /// The page or payload does not have the structure the extractor expects.
    MalformedResponse,
    Other,
}

/// Typed fetch failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Network | FetchErrorKind::Integrity
        )
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

/// Normalized persistence failure classes used by the writer's commit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    Retryable,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    pub message: String,
}

impl PersistError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == PersistErrorKind::Retryable
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PersistError {}

/// Follow-on work reconstructed from the store at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutstandingWork {
    pub cover_jobs: Vec<PictureJob>,
    pub avatar_jobs: Vec<PictureJob>,
    pub comment_jobs: Vec<CommentJob>,
}

/// Where verified pictures are written, one directory per subject kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureDirs {
    pub covers: PathBuf,
    pub avatars: PathBuf,
}

impl PictureDirs {
    /// Standard layout under the data directory.
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            covers: data_dir.join("video_pic"),
            avatars: data_dir.join("user_face"),
        }
    }

    pub fn for_kind(&self, kind: PictureKind) -> &PathBuf {
        match kind {
            PictureKind::Item => &self.covers,
            PictureKind::Owner => &self.avatars,
        }
    }
}

/// Pool sizes, queue capacity, and pacing for one harvest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub detail_workers: usize,
    pub media_workers: usize,
    pub comment_workers: usize,
    /// Capacity of the bounded task queue between the enumerator and detail fetchers.
    pub task_queue_capacity: usize,
    /// First listing page when the store holds no checkpoint.
    pub start_page: i64,
    /// Total item budget; `None` means unlimited.
    pub item_budget: Option<i64>,
    /// How long an idle consumer waits on its queues before marking itself idle.
    pub poll_wait: Duration,
    /// Delay before the enumerator retries a failed listing page.
    pub listing_retry_delay: Duration,
    pub writer_interval: Duration,
    pub monitor_interval: Duration,
    pub status_interval: Duration,
    pub commit_every: usize,
    pub commit_retry: RetryPolicy,
    pub max_image_dimension: u32,
    pub picture_dirs: PictureDirs,
}

impl PipelineConfig {
    /// Sizes every pool from the configured worker count.
    ///
    /// The media pool gets half again as many workers, rounded down.
    pub fn with_workers(workers: usize, picture_dirs: PictureDirs) -> Self {
        let workers = workers.max(1);
        Self {
            detail_workers: workers,
            media_workers: workers + workers / 2,
            comment_workers: workers,
            picture_dirs,
            ..Self::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detail_workers: 1,
            media_workers: 1,
            comment_workers: 1,
            task_queue_capacity: 100,
            start_page: 1,
            item_budget: None,
            poll_wait: Duration::from_secs(5),
            listing_retry_delay: Duration::from_secs(1),
            writer_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(10),
            commit_every: 100,
            commit_retry: RetryPolicy::default(),
            max_image_dimension: 16_384,
            picture_dirs: PictureDirs::under("data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_pool_is_one_and_a_half_times_the_worker_count() {
        let dirs = PictureDirs::under("data");
        assert_eq!(PipelineConfig::with_workers(1, dirs.clone()).media_workers, 1);
        assert_eq!(PipelineConfig::with_workers(3, dirs.clone()).media_workers, 4);
        assert_eq!(PipelineConfig::with_workers(4, dirs).media_workers, 6);
    }

    #[test]
    fn only_network_and_integrity_failures_are_retryable() {
        assert!(FetchError::new(FetchErrorKind::Network, "timeout").is_retryable());
        assert!(FetchError::new(FetchErrorKind::Integrity, "truncated").is_retryable());
        assert!(!FetchError::new(FetchErrorKind::MalformedResponse, "shape").is_retryable());
        assert!(!FetchError::new(FetchErrorKind::Other, "io").is_retryable());
    }
}
