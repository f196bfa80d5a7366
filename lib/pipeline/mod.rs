mod comment_worker;
mod detail_worker;
mod enumerator;
pub mod error;
pub mod fetcher;
pub mod flags;
mod media_worker;
mod monitor;
pub mod persister;
pub mod pool;
pub mod queues;
pub mod types;
mod writer;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use comment_worker::{comment_record, CommentWorker};
pub use detail_worker::DetailWorker;
pub use enumerator::{EnumeratorExit, ListingEnumerator};
pub use error::Error;
pub use media_worker::{picture_extension, picture_path, verify_picture, MediaWorker};
pub use monitor::{is_quiescent, MonitorExit, QuiescenceMonitor};
pub use writer::ResultWriter;

use fetcher::{CommentFetcher, DetailFetcher, ListingFetcher, PictureFetcher};
use flags::{RunProgress, WorkerRegistry, WorkerRole};
use persister::HarvestStore;
use pool::WorkerPool;
use queues::PipelineQueues;
use types::{PipelineConfig, UNLIMITED_BUDGET};

/// The four remote capabilities a run needs. Each is cloned once per worker.
#[derive(Debug, Clone)]
pub struct HarvestSources<L, D, P, C> {
    pub listing: L,
    pub detail: D,
    pub pictures: P,
    pub comments: C,
}

impl<T: Clone> HarvestSources<T, T, T, T> {
    /// One source serving every capability, usually an `Arc` of a concrete adapter.
    pub fn from_source(source: T) -> Self {
        Self {
            listing: source.clone(),
            detail: source.clone(),
            pictures: source.clone(),
            comments: source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every queue drained and every worker idle with no budget left.
    Completed,
    /// Shutdown was requested before completion.
    Interrupted,
    /// A required component stopped; carries the reason.
    Halted(String),
}

#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub outcome: RunOutcome,
    pub start_page: i64,
    pub enumerator_exit: Option<EnumeratorExit>,
    pub pages_enumerated: u64,
    pub items_enqueued: u64,
    pub deleted_items: u64,
    /// Rendered errors from workers that stopped on a fatal failure.
    pub fatal_errors: Vec<String>,
}

impl HarvestSummary {
    pub fn had_fatal_failures(&self) -> bool {
        !self.fatal_errors.is_empty() || matches!(self.outcome, RunOutcome::Halted(_))
    }

    /// `0` for a clean run (completed or interrupted), `1` when anything failed fatally.
    pub fn exit_code(&self) -> i32 {
        if self.had_fatal_failures() {
            1
        } else {
            0
        }
    }
}

/// Remaining budget given the configured total and the number of items already stored.
pub fn remaining_budget(item_budget: Option<i64>, stored_items: i64) -> i64 {
    match item_budget {
        Some(budget) if budget >= 0 => budget.saturating_sub(stored_items).max(0),
        _ => UNLIMITED_BUDGET,
    }
}

/// Runs one harvest to completion, halt, or shutdown.
///
/// Resumes from the stored checkpoint and budget, spawns the writer, enumerator, and fetcher
/// pools, and waits for the quiescence monitor. Teardown joins the enumerator, then each
/// fetcher pool, and only then lets the writer finish draining.
///
/// `run_token` is the run's stop signal. Cancelling it requests shutdown; the pipeline also
/// cancels it itself on completion or halt, so anything else holding it (a proxy lease wait,
/// the metrics server) stops with the run.
pub async fn run_pipeline<L, D, P, C, S>(
    config: PipelineConfig,
    sources: HarvestSources<L, D, P, C>,
    store: S,
    run_token: CancellationToken,
) -> Result<HarvestSummary, Error>
where
    L: ListingFetcher + 'static,
    D: DetailFetcher + Clone + 'static,
    P: PictureFetcher + Clone + 'static,
    C: CommentFetcher + Clone + 'static,
    S: HarvestStore + 'static,
{
    media_worker::ensure_picture_dirs(&config.picture_dirs).map_err(|err| {
        Error::Orchestration(format!(
            "failed to create picture directories under {}: {err}",
            config.picture_dirs.covers.display()
        ))
    })?;

    let stored_items = store.count_items().await?;
    let budget = remaining_budget(config.item_budget, stored_items);
    let start_page = store.read_checkpoint().await?.unwrap_or(config.start_page);
    info!(
        event = "harvest_resumed",
        stored_items,
        remaining_budget = if budget == UNLIMITED_BUDGET { -1 } else { budget },
        start_page,
        detail_workers = config.detail_workers,
        media_workers = config.media_workers,
        comment_workers = config.comment_workers,
        "starting harvest run"
    );

    let drain_token = CancellationToken::new();
    let queues = PipelineQueues::new(config.task_queue_capacity);
    let registry = Arc::new(WorkerRegistry::new(
        config.detail_workers,
        config.media_workers,
        config.comment_workers,
    ));
    let progress = Arc::new(RunProgress::new(budget));

    let writer = tokio::spawn(
        ResultWriter::new(
            store,
            queues.clone(),
            registry.writer().clone(),
            config.writer_interval,
            config.commit_every,
            config.commit_retry,
            drain_token.clone(),
        )
        .run(),
    );

    let enumerator = tokio::spawn(
        ListingEnumerator::new(
            sources.listing,
            queues.tasks.tx.clone(),
            progress.clone(),
            registry.enumerator().clone(),
            config.listing_retry_delay,
            run_token.clone(),
            start_page,
        )
        .run(),
    );

    let detail_flags = registry.pool(WorkerRole::Detail);
    let detail_pool = WorkerPool::spawn(WorkerRole::Detail, detail_flags, |flag| {
        DetailWorker::new(
            sources.detail.clone(),
            queues.clone(),
            progress.clone(),
            flag,
            config.poll_wait,
            run_token.clone(),
        )
        .run()
    });
    let media_flags = registry.pool(WorkerRole::Media);
    let media_pool = WorkerPool::spawn(WorkerRole::Media, media_flags, |flag| {
        MediaWorker::new(
            sources.pictures.clone(),
            queues.clone(),
            flag,
            config.picture_dirs.clone(),
            config.max_image_dimension,
            config.poll_wait,
            run_token.clone(),
        )
        .run()
    });
    let comment_flags = registry.pool(WorkerRole::Comment);
    let comment_pool = WorkerPool::spawn(WorkerRole::Comment, comment_flags, |flag| {
        CommentWorker::new(
            sources.comments.clone(),
            queues.clone(),
            flag,
            config.poll_wait,
            run_token.clone(),
        )
        .run()
    });

    let monitor_exit = QuiescenceMonitor::new(
        queues.clone(),
        registry.clone(),
        progress.clone(),
        config.monitor_interval,
        config.status_interval,
        run_token.clone(),
    )
    .run()
    .await;
    run_token.cancel();

    let outcome = match monitor_exit {
        MonitorExit::Completed => {
            info!(event = "harvest_quiescent", "all queues drained and every worker idle");
            RunOutcome::Completed
        }
        MonitorExit::Interrupted => {
            warn!(event = "harvest_interrupted", "shutdown requested, draining");
            RunOutcome::Interrupted
        }
        MonitorExit::Halted(reason) => {
            error!(event = "harvest_halted", reason = %reason, "run halted, draining");
            RunOutcome::Halted(reason)
        }
    };

    let mut fatal_errors = Vec::new();
    let enumerator_exit = match enumerator.await {
        Ok(exit) => Some(exit),
        Err(err) => {
            fatal_errors.push(format!("enumerator task failed: {err}"));
            None
        }
    };

    for pool in [detail_pool, media_pool, comment_pool] {
        let role = pool.role();
        if let Err(err) = pool.wait_for_completion().await {
            error!(
                event = "pool_join_failed",
                worker_role = %role,
                error = %err,
                "fetcher pool reported errors"
            );
            fatal_errors.extend(err.errors.iter().map(ToString::to_string));
        }
    }

    drain_token.cancel();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(event = "writer_failed", error = %err, "result writer stopped on a fatal error");
            fatal_errors.push(err.to_string());
        }
        Err(err) => fatal_errors.push(format!("writer task failed: {err}")),
    }

    let summary = HarvestSummary {
        outcome,
        start_page,
        enumerator_exit,
        pages_enumerated: progress.pages_enumerated(),
        items_enqueued: progress.items_enqueued(),
        deleted_items: progress.deleted_items(),
        fatal_errors,
    };
    info!(
        event = "harvest_finished",
        outcome = ?summary.outcome,
        enumerator_exit = ?summary.enumerator_exit,
        pages_enumerated = summary.pages_enumerated,
        items_enqueued = summary.items_enqueued,
        deleted_items = summary.deleted_items,
        fatal_errors = summary.fatal_errors.len(),
        "harvest run finished"
    );
    Ok(summary)
}
