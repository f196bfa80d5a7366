use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use tokio_util::sync::CancellationToken;

use super::fetcher::ListingFetcher;
use super::flags::{RunProgress, WorkerFlag};
use super::pool::ExitGuard;
use super::queues::send_blocking;
use super::types::{FetchErrorKind, TaskDescriptor};

/// Why the enumerator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumeratorExit {
    BudgetSpent,
    CatalogExhausted,
    Interrupted,
}

/// Walks the listing from `start_page`, feeding the bounded task queue.
pub struct ListingEnumerator<L> {
    fetcher: L,
    tasks: Sender<TaskDescriptor>,
    progress: Arc<RunProgress>,
    flag: WorkerFlag,
    retry_delay: Duration,
    shutdown: CancellationToken,
    page_number: i64,
}

impl<L> ListingEnumerator<L>
where
    L: ListingFetcher,
{
    pub fn new(
        fetcher: L,
        tasks: Sender<TaskDescriptor>,
        progress: Arc<RunProgress>,
        flag: WorkerFlag,
        retry_delay: Duration,
        shutdown: CancellationToken,
        start_page: i64,
    ) -> Self {
        Self {
            fetcher,
            tasks,
            progress,
            flag,
            retry_delay,
            shutdown,
            page_number: start_page,
        }
    }

    /// Runs until the budget is spent, the catalog runs out, or shutdown.
    ///
    /// A failed page is retried indefinitely; only shutdown interrupts those retries.
    pub async fn run(mut self) -> EnumeratorExit {
        let _guard = ExitGuard(self.flag.clone());
        tracing::info!(
            event = "enumerator_started",
            page = self.page_number,
            remaining_budget = self.progress.remaining_budget(),
            "resuming listing enumeration"
        );

        let exit = self.enumerate().await;
        tracing::info!(
            event = "enumerator_finished",
            page = self.page_number,
            exit = ?exit,
            items_enqueued = self.progress.items_enqueued(),
            "listing enumeration stopped"
        );
        exit
    }

    async fn enumerate(&mut self) -> EnumeratorExit {
        loop {
            if self.progress.remaining_budget() <= 0 {
                tracing::warn!(
                    event = "enumerator_budget_spent",
                    page = self.page_number,
                    "item budget reached, no more listing pages"
                );
                return EnumeratorExit::BudgetSpent;
            }
            if self.shutdown.is_cancelled() {
                return EnumeratorExit::Interrupted;
            }

            let entries = match self.fetcher.fetch_listing(self.page_number).await {
                Ok(entries) => entries,
                Err(err) => {
                    if err.kind == FetchErrorKind::Network {
                        tracing::debug!(
                            event = "listing_page_retry",
                            page = self.page_number,
                            error = %err,
                            "listing page fetch failed, retrying"
                        );
                    } else {
                        tracing::warn!(
                            event = "listing_page_retry",
                            page = self.page_number,
                            error = %err,
                            "listing page unusable, retrying"
                        );
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return EnumeratorExit::Interrupted,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    continue;
                }
            };

            if entries.is_empty() {
                self.progress.exhaust_budget();
                tracing::warn!(
                    event = "enumerator_catalog_exhausted",
                    page = self.page_number,
                    "listing returned an empty page"
                );
                return EnumeratorExit::CatalogExhausted;
            }

            let listed = entries.len();
            let mut enqueued = 0usize;
            for entry in entries {
                if self.progress.remaining_budget() <= 0 {
                    break;
                }
                let task = entry.into_task(self.page_number);
                if !send_blocking(&self.tasks, task, &self.shutdown).await {
                    return EnumeratorExit::Interrupted;
                }
                self.progress.consume_budget();
                enqueued += 1;
            }

            self.progress.record_page();
            tracing::info!(
                event = "listing_page_enqueued",
                page = self.page_number,
                listed,
                enqueued,
                "listing page enqueued"
            );
            self.page_number += 1;
        }
    }
}
