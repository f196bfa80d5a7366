use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the build labels survive text exposition.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "bili_harvester",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Default)]
pub struct HarvestMetrics {
    pub items_persisted_total: Counter,
    pub owners_persisted_total: Counter,
    pub comments_persisted_total: Counter,
    pub covers_stored_total: Counter,
    pub avatars_stored_total: Counter,
    /// Store transactions committed by the writer.
    pub batches_committed_total: Counter,
    /// Units of work put back on a queue after a transient failure.
    pub requeues_total: Counter,
    pub deleted_items_total: Counter,
    pub worker_failures_total: Counter,
    /// `-1` when the run has no item limit.
    pub remaining_budget: Gauge,
    pub task_queue_depth: Gauge,
    pub retry_queue_depth: Gauge,
    pub cover_job_depth: Gauge,
    pub avatar_job_depth: Gauge,
    pub comment_job_depth: Gauge,
    /// Sum of the five queues the writer drains.
    pub result_queue_depth: Gauge,
    pub busy_workers: Gauge,
}

impl HarvestMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "items_persisted",
            "Total number of item rows written",
            metrics.items_persisted_total.clone(),
        );
        sub_registry.register(
            "owners_persisted",
            "Total number of owner rows written",
            metrics.owners_persisted_total.clone(),
        );
        sub_registry.register(
            "comments_persisted",
            "Total number of comment rows written",
            metrics.comments_persisted_total.clone(),
        );
        sub_registry.register(
            "covers_stored",
            "Total number of item covers verified and stored",
            metrics.covers_stored_total.clone(),
        );
        sub_registry.register(
            "avatars_stored",
            "Total number of owner avatars verified and stored",
            metrics.avatars_stored_total.clone(),
        );
        sub_registry.register(
            "batches_committed",
            "Total number of store transactions committed",
            metrics.batches_committed_total.clone(),
        );
        sub_registry.register(
            "requeues",
            "Total number of work units requeued after a transient failure",
            metrics.requeues_total.clone(),
        );
        sub_registry.register(
            "deleted_items",
            "Total number of tasks dropped because the source deleted the item",
            metrics.deleted_items_total.clone(),
        );
        sub_registry.register(
            "worker_failures",
            "Total number of workers terminated by a fatal error",
            metrics.worker_failures_total.clone(),
        );
        sub_registry.register(
            "remaining_budget",
            "Items the enumerator may still enqueue (-1 when unlimited)",
            metrics.remaining_budget.clone(),
        );
        sub_registry.register(
            "task_queue_depth",
            "Tasks waiting in the bounded task queue",
            metrics.task_queue_depth.clone(),
        );
        sub_registry.register(
            "retry_queue_depth",
            "Tasks waiting in the retry queue",
            metrics.retry_queue_depth.clone(),
        );
        sub_registry.register(
            "cover_job_depth",
            "Item picture jobs waiting",
            metrics.cover_job_depth.clone(),
        );
        sub_registry.register(
            "avatar_job_depth",
            "Owner picture jobs waiting",
            metrics.avatar_job_depth.clone(),
        );
        sub_registry.register(
            "comment_job_depth",
            "Comment jobs waiting",
            metrics.comment_job_depth.clone(),
        );
        sub_registry.register(
            "result_queue_depth",
            "Results waiting for the writer",
            metrics.result_queue_depth.clone(),
        );
        sub_registry.register(
            "busy_workers",
            "Workers not currently reporting idle",
            metrics.busy_workers.clone(),
        );
        metrics
    }
}

pub static HARVEST_METRICS: OnceCell<HarvestMetrics> = OnceCell::const_new();
