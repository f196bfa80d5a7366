use std::time::Duration;

use flume::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::db::{CommentRecord, OwnerRecord};

use super::types::{CommentJob, IngestedItem, PictureJob, PictureKind, TaskDescriptor};

/// Both ends of one channel.
#[derive(Debug)]
pub struct Queue<T> {
    pub tx: Sender<T>,
    pub rx: Receiver<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Queue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Enqueues onto an unbounded queue.
    ///
    /// The pipeline keeps a receiver alive for the whole run, so this only fails after teardown.
    pub fn push(&self, value: T) {
        if self.tx.send(value).is_err() {
            tracing::error!(event = "queue_send_failed", "queue receiver dropped");
        }
    }
}

/// Every queue in the pipeline. Cloning shares the underlying channels.
#[derive(Debug, Clone)]
pub struct PipelineQueues {
    /// Bounded; the enumerator's backpressure point.
    pub tasks: Queue<TaskDescriptor>,
    pub retries: Queue<TaskDescriptor>,
    pub item_results: Queue<IngestedItem>,
    pub owner_results: Queue<OwnerRecord>,
    pub cover_jobs: Queue<PictureJob>,
    pub avatar_jobs: Queue<PictureJob>,
    pub covers_stored: Queue<i64>,
    pub avatars_stored: Queue<i64>,
    pub comment_jobs: Queue<CommentJob>,
    pub comment_results: Queue<CommentRecord>,
}

impl PipelineQueues {
    pub fn new(task_capacity: usize) -> Self {
        Self {
            tasks: Queue::bounded(task_capacity.max(1)),
            retries: Queue::unbounded(),
            item_results: Queue::unbounded(),
            owner_results: Queue::unbounded(),
            cover_jobs: Queue::unbounded(),
            avatar_jobs: Queue::unbounded(),
            covers_stored: Queue::unbounded(),
            avatars_stored: Queue::unbounded(),
            comment_jobs: Queue::unbounded(),
            comment_results: Queue::unbounded(),
        }
    }

    pub fn picture_jobs(&self, kind: PictureKind) -> &Queue<PictureJob> {
        match kind {
            PictureKind::Item => &self.cover_jobs,
            PictureKind::Owner => &self.avatar_jobs,
        }
    }

    pub fn pictures_stored(&self, kind: PictureKind) -> &Queue<i64> {
        match kind {
            PictureKind::Item => &self.covers_stored,
            PictureKind::Owner => &self.avatars_stored,
        }
    }

    /// The five queues the writer drains.
    pub fn results_empty(&self) -> bool {
        self.item_results.is_empty()
            && self.owner_results.is_empty()
            && self.covers_stored.is_empty()
            && self.avatars_stored.is_empty()
            && self.comment_results.is_empty()
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            tasks: self.tasks.len(),
            retries: self.retries.len(),
            cover_jobs: self.cover_jobs.len(),
            avatar_jobs: self.avatar_jobs.len(),
            comment_jobs: self.comment_jobs.len(),
            item_results: self.item_results.len(),
            owner_results: self.owner_results.len(),
            covers_stored: self.covers_stored.len(),
            avatars_stored: self.avatars_stored.len(),
            comment_results: self.comment_results.len(),
        }
    }
}

/// Point-in-time depth of every queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub tasks: usize,
    pub retries: usize,
    pub cover_jobs: usize,
    pub avatar_jobs: usize,
    pub comment_jobs: usize,
    pub item_results: usize,
    pub owner_results: usize,
    pub covers_stored: usize,
    pub avatars_stored: usize,
    pub comment_results: usize,
}

impl QueueDepths {
    /// Task, retry, and the three job queues.
    pub fn work_queues_empty(&self) -> bool {
        self.tasks == 0
            && self.retries == 0
            && self.cover_jobs == 0
            && self.avatar_jobs == 0
            && self.comment_jobs == 0
    }

    pub fn result_queues_empty(&self) -> bool {
        self.item_results == 0
            && self.owner_results == 0
            && self.covers_stored == 0
            && self.avatars_stored == 0
            && self.comment_results == 0
    }

    pub fn all_empty(&self) -> bool {
        self.work_queues_empty() && self.result_queues_empty()
    }
}

/// Result of one bounded wait on a consumer's queues.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    Item(T),
    TimedOut,
    Shutdown,
}

/// Takes from `preferred` whenever it has work, otherwise from `fallback`, waiting at most `wait`.
pub async fn recv_prioritized<T>(
    preferred: &Receiver<T>,
    fallback: &Receiver<T>,
    wait: Duration,
    shutdown: &CancellationToken,
) -> Received<T> {
    if shutdown.is_cancelled() {
        return Received::Shutdown;
    }
    if let Ok(value) = preferred.try_recv() {
        return Received::Item(value);
    }
    if let Ok(value) = fallback.try_recv() {
        return Received::Item(value);
    }

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Received::Shutdown,
        Ok(value) = preferred.recv_async() => Received::Item(value),
        Ok(value) = fallback.recv_async() => Received::Item(value),
        _ = tokio::time::sleep(wait) => Received::TimedOut,
    }
}

/// Single-queue form of [`recv_prioritized`].
pub async fn recv_timeout<T>(
    queue: &Receiver<T>,
    wait: Duration,
    shutdown: &CancellationToken,
) -> Received<T> {
    if shutdown.is_cancelled() {
        return Received::Shutdown;
    }
    if let Ok(value) = queue.try_recv() {
        return Received::Item(value);
    }

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Received::Shutdown,
        Ok(value) = queue.recv_async() => Received::Item(value),
        _ = tokio::time::sleep(wait) => Received::TimedOut,
    }
}

/// Sends onto a bounded queue, blocking while it is full. Returns `false` on shutdown.
pub async fn send_blocking<T>(queue: &Sender<T>, value: T, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = queue.send_async(value) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(item_id: i64) -> TaskDescriptor {
        TaskDescriptor {
            item_id,
            item_key: format!("BV{item_id}"),
            content_id: item_id,
            page_number: 1,
        }
    }

    #[tokio::test]
    async fn preferred_queue_wins_when_both_hold_work() {
        let queues = PipelineQueues::new(4);
        queues.tasks.tx.send(task(1)).expect("send task");
        queues.retries.push(task(2));

        let shutdown = CancellationToken::new();
        let first = recv_prioritized(
            &queues.retries.rx,
            &queues.tasks.rx,
            Duration::from_millis(10),
            &shutdown,
        )
        .await;
        let second = recv_prioritized(
            &queues.retries.rx,
            &queues.tasks.rx,
            Duration::from_millis(10),
            &shutdown,
        )
        .await;

        assert_eq!(first, Received::Item(task(2)));
        assert_eq!(second, Received::Item(task(1)));
    }

    #[tokio::test]
    async fn empty_queues_time_out() {
        let queue = Queue::<i64>::unbounded();
        let shutdown = CancellationToken::new();
        assert_eq!(
            recv_timeout(&queue.rx, Duration::from_millis(5), &shutdown).await,
            Received::TimedOut
        );
    }

    #[tokio::test]
    async fn waits_observe_shutdown() {
        let queue = Queue::<i64>::unbounded();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(
            recv_timeout(&queue.rx, Duration::from_secs(60), &shutdown).await,
            Received::Shutdown
        );
    }

    #[tokio::test]
    async fn full_bounded_queue_blocks_until_shutdown() {
        let queue = Queue::<i64>::bounded(1);
        let shutdown = CancellationToken::new();
        assert!(send_blocking(&queue.tx, 1, &shutdown).await);

        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            send_blocking(&queue.tx, 2, &shutdown),
        )
        .await;
        assert!(blocked.is_err(), "second send must wait for capacity");

        shutdown.cancel();
        assert!(!send_blocking(&queue.tx, 2, &shutdown).await);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn depths_split_work_and_result_queues() {
        let queues = PipelineQueues::new(2);
        assert!(queues.depths().all_empty());

        queues.covers_stored.push(5);
        let depths = queues.depths();
        assert!(depths.work_queues_empty());
        assert!(!depths.result_queues_empty());
        assert!(!queues.results_empty());
    }
}
