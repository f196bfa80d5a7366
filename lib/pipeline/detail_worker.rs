use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::server::monitoring::HARVEST_METRICS;

use super::error::Error;
use super::fetcher::DetailFetcher;
use super::flags::{RunProgress, WorkerFlag};
use super::queues::{recv_prioritized, PipelineQueues, Received};
use super::types::{DetailOutcome, IngestedItem, TaskDescriptor};

/// Turns task descriptors into item and owner records.
pub struct DetailWorker<F> {
    fetcher: F,
    queues: PipelineQueues,
    progress: Arc<RunProgress>,
    flag: WorkerFlag,
    poll_wait: Duration,
    shutdown: CancellationToken,
}

impl<F> DetailWorker<F>
where
    F: DetailFetcher,
{
    pub fn new(
        fetcher: F,
        queues: PipelineQueues,
        progress: Arc<RunProgress>,
        flag: WorkerFlag,
        poll_wait: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            queues,
            progress,
            flag,
            poll_wait,
            shutdown,
        }
    }

    /// Takes retried tasks before fresh ones and keeps polling until shutdown.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let task = match recv_prioritized(
                &self.queues.retries.rx,
                &self.queues.tasks.rx,
                self.poll_wait,
                &self.shutdown,
            )
            .await
            {
                Received::Item(task) => task,
                Received::TimedOut => {
                    self.flag.set_idle(true);
                    continue;
                }
                Received::Shutdown => return Ok(()),
            };

            self.flag.set_idle(false);
            self.process(task).await?;
        }
    }

    async fn process(&self, task: TaskDescriptor) -> Result<(), Error> {
        match self.fetcher.fetch_detail(&task).await {
            Ok(DetailOutcome::Found { item, owner }) => {
                tracing::info!(
                    event = "detail_fetched",
                    worker_index = self.flag.index(),
                    item_id = task.item_id,
                    owner_id = owner.owner_id,
                    "fetched item detail"
                );
                self.queues.item_results.push(IngestedItem {
                    record: item,
                    page_number: task.page_number,
                });
                self.queues.owner_results.push(owner);
                Ok(())
            }
            Ok(DetailOutcome::Deleted) => {
                self.progress.record_deleted();
                if let Some(metrics) = HARVEST_METRICS.get() {
                    metrics.deleted_items_total.inc();
                }
                tracing::warn!(
                    event = "detail_item_deleted",
                    item_id = task.item_id,
                    item_key = %task.item_key,
                    "item deleted at source, dropping task"
                );
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                if let Some(metrics) = HARVEST_METRICS.get() {
                    metrics.requeues_total.inc();
                }
                tracing::debug!(
                    event = "detail_fetch_requeued",
                    item_id = task.item_id,
                    error = %err,
                    "detail fetch failed, requeued"
                );
                self.queues.retries.push(task);
                Ok(())
            }
            Err(err) => {
                let unit = format!("item {}", task.item_id);
                self.queues.retries.push(task);
                Err(Error::WorkerFatal {
                    role: self.flag.role(),
                    index: self.flag.index(),
                    unit,
                    source: err,
                })
            }
        }
    }
}
