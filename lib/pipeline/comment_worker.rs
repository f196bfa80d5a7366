use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::CommentRecord;
use crate::server::monitoring::HARVEST_METRICS;

use super::error::Error;
use super::fetcher::CommentFetcher;
use super::flags::WorkerFlag;
use super::queues::{recv_timeout, PipelineQueues, Received};
use super::types::{unix_now, CommentJob, CommentPage, FetchError, FetchErrorKind};

pub struct CommentWorker<F> {
    fetcher: F,
    queues: PipelineQueues,
    flag: WorkerFlag,
    poll_wait: Duration,
    shutdown: CancellationToken,
}

impl<F> CommentWorker<F>
where
    F: CommentFetcher,
{
    pub fn new(
        fetcher: F,
        queues: PipelineQueues,
        flag: WorkerFlag,
        poll_wait: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            queues,
            flag,
            poll_wait,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), Error> {
        loop {
            let job = match recv_timeout(
                &self.queues.comment_jobs.rx,
                self.poll_wait,
                &self.shutdown,
            )
            .await
            {
                Received::Item(job) => job,
                Received::TimedOut => {
                    self.flag.set_idle(true);
                    continue;
                }
                Received::Shutdown => return Ok(()),
            };

            self.flag.set_idle(false);
            self.process(job).await?;
        }
    }

    async fn process(&self, job: CommentJob) -> Result<(), Error> {
        let page = match self.fetcher.fetch_comments(job.item_id).await {
            Ok(page) => page,
            Err(err) if err.is_retryable() => {
                if let Some(metrics) = HARVEST_METRICS.get() {
                    metrics.requeues_total.inc();
                }
                tracing::debug!(
                    event = "comment_fetch_requeued",
                    item_id = job.item_id,
                    error = %err,
                    "comment fetch failed, requeued"
                );
                self.queues.comment_jobs.push(job);
                return Ok(());
            }
            Err(err) => {
                self.queues.comment_jobs.push(job);
                return Err(Error::WorkerFatal {
                    role: self.flag.role(),
                    index: self.flag.index(),
                    unit: format!("comments for item {}", job.item_id),
                    source: err,
                });
            }
        };

        let messages = match page {
            CommentPage::Replies(messages) => messages,
            CommentPage::Degraded { reason } => {
                tracing::warn!(
                    event = "comment_payload_degraded",
                    item_id = job.item_id,
                    reason = %reason,
                    "unexpected reply payload, storing empty comment list"
                );
                Vec::new()
            }
        };

        let record = comment_record(job.item_id, &messages).map_err(|source| Error::WorkerFatal {
            role: self.flag.role(),
            index: self.flag.index(),
            unit: format!("comments for item {}", job.item_id),
            source,
        })?;
        tracing::info!(
            event = "comments_fetched",
            item_id = job.item_id,
            message_count = messages.len(),
            "fetched first reply page"
        );
        self.queues.comment_results.push(record);
        Ok(())
    }
}

/// Serializes the retained message bodies as a JSON array.
pub fn comment_record(item_id: i64, messages: &[String]) -> Result<CommentRecord, FetchError> {
    let messages = serde_json::to_string(messages).map_err(|err| {
        FetchError::new(
            FetchErrorKind::Other,
            format!("failed to serialize comments for item {item_id}: {err}"),
        )
    })?;
    Ok(CommentRecord {
        item_id,
        messages,
        ingest_time: unix_now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::flags::{WorkerRegistry, WorkerRole};
    use crate::pipeline::test_support::MockComments;

    async fn run_until_idle(
        fetcher: MockComments,
        queues: &PipelineQueues,
    ) -> Result<(), Error> {
        let registry = WorkerRegistry::new(0, 0, 1);
        let flag = registry.pool(WorkerRole::Comment)[0].clone();
        let shutdown = CancellationToken::new();
        let worker = CommentWorker::new(
            fetcher,
            queues.clone(),
            flag.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        let handle = tokio::spawn(worker.run());
        for _ in 0..200 {
            if flag.is_idle() || handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.expect("join comment worker")
    }

    #[test]
    fn messages_are_stored_as_a_json_array() {
        let record = comment_record(5, &["first".to_string(), "say \"hi\"".to_string()])
            .expect("serializable");
        assert_eq!(record.item_id, 5);
        assert_eq!(record.messages, r#"["first","say \"hi\""]"#);
    }

    #[tokio::test]
    async fn replies_become_a_comment_record() {
        let fetcher = MockComments::with_plan(vec![(
            1,
            vec![Ok(CommentPage::Replies(vec!["nice".into(), "again".into()]))],
        )]);
        let queues = PipelineQueues::new(1);
        queues.comment_jobs.push(CommentJob { item_id: 1 });

        run_until_idle(fetcher, &queues).await.expect("clean exit");

        let record = queues
            .comment_results
            .rx
            .try_recv()
            .expect("comment record");
        assert_eq!(record.item_id, 1);
        assert_eq!(record.messages, r#"["nice","again"]"#);
    }

    #[tokio::test]
    async fn degraded_payload_stores_an_empty_list() {
        let fetcher = MockComments::with_plan(vec![(
            2,
            vec![Ok(CommentPage::Degraded {
                reason: "replies is not an array".into(),
            })],
        )]);
        let queues = PipelineQueues::new(1);
        queues.comment_jobs.push(CommentJob { item_id: 2 });

        run_until_idle(fetcher, &queues).await.expect("clean exit");

        let record = queues
            .comment_results
            .rx
            .try_recv()
            .expect("comment record");
        assert_eq!(record.messages, "[]");
    }

    #[tokio::test]
    async fn network_failure_requeues_the_job() {
        let fetcher = MockComments::with_plan(vec![(
            3,
            vec![
                Err(FetchError::network("connection reset")),
                Ok(CommentPage::Replies(vec!["late".into()])),
            ],
        )]);
        let calls = fetcher.clone();
        let queues = PipelineQueues::new(1);
        queues.comment_jobs.push(CommentJob { item_id: 3 });

        run_until_idle(fetcher, &queues).await.expect("clean exit");

        assert_eq!(calls.calls_for(3), 2);
        assert_eq!(queues.comment_results.len(), 1);
        assert!(queues.comment_jobs.is_empty());
    }

    #[tokio::test]
    async fn unexpected_failure_is_fatal_and_requeues() {
        let fetcher = MockComments::with_plan(vec![(
            4,
            vec![Err(FetchError::new(FetchErrorKind::Other, "boom"))],
        )]);
        let queues = PipelineQueues::new(1);
        queues.comment_jobs.push(CommentJob { item_id: 4 });

        let err = run_until_idle(fetcher, &queues).await.expect_err("fatal");

        assert!(matches!(err, Error::WorkerFatal { role: WorkerRole::Comment, .. }));
        assert_eq!(
            queues.comment_jobs.rx.try_recv().expect("requeued"),
            CommentJob { item_id: 4 }
        );
    }
}
