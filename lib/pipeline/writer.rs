use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::StoreWrite;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::server::monitoring::HARVEST_METRICS;

use super::error::Error;
use super::flags::WorkerFlag;
use super::persister::HarvestStore;
use super::pool::ExitGuard;
use super::queues::PipelineQueues;
use super::types::{CommentJob, PictureJob, PictureKind};

/// The only component that mutates the store.
///
/// Turns results into store writes and derived jobs, buffering writes and committing them in
/// batches. Runs until the drain token is cancelled and every result queue is empty.
pub struct ResultWriter<S> {
    store: S,
    queues: PipelineQueues,
    flag: WorkerFlag,
    interval: Duration,
    commit_every: usize,
    commit_retry: RetryPolicy,
    drain: CancellationToken,
    pending: Vec<StoreWrite>,
}

impl<S> ResultWriter<S>
where
    S: HarvestStore,
{
    pub fn new(
        store: S,
        queues: PipelineQueues,
        flag: WorkerFlag,
        interval: Duration,
        commit_every: usize,
        commit_retry: RetryPolicy,
        drain: CancellationToken,
    ) -> Self {
        Self {
            store,
            queues,
            flag,
            interval,
            commit_every: commit_every.max(1),
            commit_retry,
            drain,
            pending: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        let _guard = ExitGuard(self.flag.clone());
        self.seed_outstanding_jobs().await?;

        while !self.drain.is_cancelled() || !self.queues.results_empty() {
            let drained = self.drain_pass().await?;

            tokio::select! {
                _ = self.drain.cancelled() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.flag.set_idle(drained == 0 && self.queues.results_empty());
        }

        self.flush().await?;
        tracing::info!(event = "writer_finished", "result writer drained and flushed");
        Ok(())
    }

    /// Re-creates picture and comment jobs that a previous run derived but never finished.
    async fn seed_outstanding_jobs(&self) -> Result<(), Error> {
        let work = self.store.load_outstanding().await?;
        tracing::info!(
            event = "writer_seeded_jobs",
            cover_jobs = work.cover_jobs.len(),
            avatar_jobs = work.avatar_jobs.len(),
            comment_jobs = work.comment_jobs.len(),
            "seeded outstanding jobs from store"
        );
        for job in work.cover_jobs {
            self.queues.cover_jobs.push(job);
        }
        for job in work.avatar_jobs {
            self.queues.avatar_jobs.push(job);
        }
        for job in work.comment_jobs {
            self.queues.comment_jobs.push(job);
        }
        Ok(())
    }

    /// Drains each result queue once, in a fixed order. Returns how many results were taken.
    async fn drain_pass(&mut self) -> Result<usize, Error> {
        let mut drained = 0;

        while let Ok(ingested) = self.queues.item_results.rx.try_recv() {
            self.flag.set_idle(false);
            drained += 1;
            let record = ingested.record;
            self.queues
                .cover_jobs
                .push(PictureJob::cover(record.item_id, record.cover_ref.clone()));
            self.queues.comment_jobs.push(CommentJob {
                item_id: record.item_id,
            });
            self.stage(StoreWrite::UpsertItem(record)).await?;
            self.stage(StoreWrite::AdvanceCheckpoint(ingested.page_number))
                .await?;
        }

        while let Ok(owner) = self.queues.owner_results.rx.try_recv() {
            self.flag.set_idle(false);
            drained += 1;
            self.queues
                .avatar_jobs
                .push(PictureJob::avatar(owner.owner_id, owner.avatar_ref.clone()));
            self.stage(StoreWrite::UpsertOwner(owner)).await?;
        }

        for kind in [PictureKind::Item, PictureKind::Owner] {
            while let Ok(subject_id) = self.queues.pictures_stored(kind).rx.try_recv() {
                self.flag.set_idle(false);
                drained += 1;
                let write = match kind {
                    PictureKind::Item => StoreWrite::MarkCoverStored(subject_id),
                    PictureKind::Owner => StoreWrite::MarkAvatarStored(subject_id),
                };
                self.stage(write).await?;
            }
        }

        while let Ok(comment) = self.queues.comment_results.rx.try_recv() {
            self.flag.set_idle(false);
            drained += 1;
            self.stage(StoreWrite::UpsertComment(comment)).await?;
        }

        Ok(drained)
    }

    async fn stage(&mut self, write: StoreWrite) -> Result<(), Error> {
        self.pending.push(write);
        if self.pending.len() >= self.commit_every {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commits every pending write in one transaction, retrying transient store failures.
    async fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let store = &self.store;
        let pending = &self.pending;
        let result = run_with_retry(
            &self.commit_retry,
            pending.len() as i64,
            |attempt| {
                if attempt > 1 {
                    tracing::warn!(
                        event = "writer_commit_retry",
                        attempt,
                        writes = pending.len(),
                        "retrying store commit"
                    );
                }
                store.apply_batch(pending)
            },
            |err| err.is_retryable(),
        )
        .await;

        match result {
            Ok(((), attempts)) => {
                record_committed(&self.pending);
                tracing::info!(
                    event = "writer_batch_committed",
                    writes = self.pending.len(),
                    attempts,
                    "committed store batch"
                );
                self.pending.clear();
                Ok(())
            }
            Err(terminal) => {
                tracing::error!(
                    event = "writer_commit_failed",
                    writes = self.pending.len(),
                    attempts = terminal.attempts,
                    exhausted_retryable = terminal.exhausted_retryable,
                    error = %terminal.error,
                    "store commit failed"
                );
                Err(Error::Persist(terminal.error))
            }
        }
    }
}

fn record_committed(writes: &[StoreWrite]) {
    let Some(metrics) = HARVEST_METRICS.get() else {
        return;
    };
    metrics.batches_committed_total.inc();
    for write in writes {
        match write {
            StoreWrite::UpsertItem(_) => metrics.items_persisted_total.inc(),
            StoreWrite::UpsertOwner(_) => metrics.owners_persisted_total.inc(),
            StoreWrite::UpsertComment(_) => metrics.comments_persisted_total.inc(),
            StoreWrite::MarkCoverStored(_) => metrics.covers_stored_total.inc(),
            StoreWrite::MarkAvatarStored(_) => metrics.avatars_stored_total.inc(),
            StoreWrite::AdvanceCheckpoint(_) => continue,
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::sqlite_test::{sample_comment, sample_item, sample_owner};
    use crate::db::SqliteStore;
    use crate::pipeline::flags::WorkerRegistry;
    use crate::pipeline::test_support::FlakyStore;
    use crate::pipeline::types::{IngestedItem, PersistError};

    fn no_wait_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::constant(max_attempts, Duration::ZERO)
    }

    fn writer<S: HarvestStore>(
        store: S,
        queues: &PipelineQueues,
        commit_every: usize,
        commit_retry: RetryPolicy,
    ) -> (ResultWriter<S>, WorkerRegistry, CancellationToken) {
        let registry = WorkerRegistry::new(0, 0, 0);
        let drain = CancellationToken::new();
        let writer = ResultWriter::new(
            store,
            queues.clone(),
            registry.writer().clone(),
            Duration::from_millis(5),
            commit_every,
            commit_retry,
            drain.clone(),
        );
        (writer, registry, drain)
    }

    fn ingested(item_id: i64, owner_id: i64, page_number: i64) -> IngestedItem {
        IngestedItem {
            record: sample_item(item_id, owner_id),
            page_number,
        }
    }

    #[tokio::test]
    async fn results_are_persisted_and_jobs_derived() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let queues = PipelineQueues::new(1);
        queues.item_results.push(ingested(1, 9, 2));
        queues.owner_results.push(sample_owner(9));
        queues.comment_results.push(sample_comment(1, &["hi"]));

        let (writer, registry, drain) = writer(store.clone(), &queues, 100, no_wait_retry(1));
        drain.cancel();
        writer.run().await.expect("writer finishes");

        assert_eq!(store.load_item(1).await.expect("load"), Some(sample_item(1, 9)));
        assert_eq!(store.load_owner(9).await.expect("load"), Some(sample_owner(9)));
        assert_eq!(store.read_checkpoint().await.expect("checkpoint"), Some(2));
        assert_eq!(
            store.load_comment(1).await.expect("load").map(|c| c.messages),
            Some(r#"["hi"]"#.to_string())
        );

        // Seeding ran against an empty store, so every job here was derived from a result.
        assert_eq!(
            queues.cover_jobs.rx.try_recv().expect("cover job"),
            PictureJob::cover(1, sample_item(1, 9).cover_ref)
        );
        assert_eq!(
            queues.avatar_jobs.rx.try_recv().expect("avatar job"),
            PictureJob::avatar(9, sample_owner(9).avatar_ref)
        );
        assert_eq!(
            queues.comment_jobs.rx.try_recv().expect("comment job"),
            CommentJob { item_id: 1 }
        );
        assert!(!registry.writer().is_alive());
    }

    #[tokio::test]
    async fn startup_seeds_jobs_for_unfinished_work() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .apply_batch(vec![
                StoreWrite::UpsertItem(sample_item(1, 9)),
                StoreWrite::UpsertItem(sample_item(2, 9)),
                StoreWrite::UpsertOwner(sample_owner(9)),
                StoreWrite::MarkCoverStored(2),
                StoreWrite::UpsertComment(sample_comment(2, &[])),
            ])
            .await
            .expect("seed store");
        let queues = PipelineQueues::new(1);

        let (writer, _registry, drain) = writer(store, &queues, 100, no_wait_retry(1));
        drain.cancel();
        writer.run().await.expect("writer finishes");

        assert_eq!(queues.cover_jobs.len(), 1);
        assert_eq!(
            queues.cover_jobs.rx.try_recv().expect("cover").subject_id,
            1
        );
        assert_eq!(queues.avatar_jobs.len(), 1);
        assert_eq!(queues.comment_jobs.len(), 1);
        assert_eq!(
            queues.comment_jobs.rx.try_recv().expect("comment"),
            CommentJob { item_id: 1 }
        );
    }

    #[tokio::test]
    async fn writes_are_committed_in_batches_with_a_final_partial_batch() {
        let store = FlakyStore::default();
        let batches = store.clone();
        let queues = PipelineQueues::new(1);
        queues.item_results.push(ingested(1, 9, 1));
        queues.owner_results.push(sample_owner(9));

        let (writer, _registry, drain) = writer(store, &queues, 2, no_wait_retry(1));
        drain.cancel();
        writer.run().await.expect("writer finishes");

        let sizes: Vec<usize> = batches.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(
            batches.batches()[1],
            vec![StoreWrite::UpsertOwner(sample_owner(9))]
        );
    }

    #[tokio::test]
    async fn transient_commit_failures_are_retried() {
        let store = FlakyStore::with_outcomes(vec![
            Err(PersistError::retryable("database is locked")),
            Ok(()),
        ]);
        let calls = store.clone();
        let queues = PipelineQueues::new(1);
        queues.owner_results.push(sample_owner(3));

        let (writer, _registry, drain) = writer(store, &queues, 100, no_wait_retry(3));
        drain.cancel();
        writer.run().await.expect("retry succeeds");

        assert_eq!(calls.calls(), 2);
        assert_eq!(calls.batches().len(), 1);
    }

    #[tokio::test]
    async fn fatal_commit_failure_stops_the_writer() {
        let store = FlakyStore::with_outcomes(vec![Err(PersistError::fatal("disk I/O error"))]);
        let calls = store.clone();
        let queues = PipelineQueues::new(1);
        queues.owner_results.push(sample_owner(3));

        let (writer, registry, drain) = writer(store, &queues, 100, no_wait_retry(3));
        drain.cancel();
        let err = writer.run().await.expect_err("fatal store error");

        assert!(matches!(err, Error::Persist(ref e) if !e.is_retryable()));
        assert_eq!(calls.calls(), 1);
        assert!(!registry.writer().is_alive());
    }

    #[tokio::test]
    async fn writer_goes_idle_between_empty_passes() {
        let store = FlakyStore::default();
        let queues = PipelineQueues::new(1);
        let (writer, registry, drain) = writer(store, &queues, 100, no_wait_retry(1));
        let flag = registry.writer().clone();
        let handle = tokio::spawn(writer.run());

        for _ in 0..100 {
            if flag.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(flag.is_idle());

        queues.owner_results.push(sample_owner(5));
        for _ in 0..100 {
            if queues.results_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(queues.results_empty());

        drain.cancel();
        handle.await.expect("join").expect("writer finishes");
        assert_eq!(queues.avatar_jobs.len(), 1);
    }
}
