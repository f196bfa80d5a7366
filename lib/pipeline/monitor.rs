use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::server::monitoring::HARVEST_METRICS;

use super::flags::{RunProgress, WorkerRegistry};
use super::queues::{PipelineQueues, QueueDepths};
use super::types::UNLIMITED_BUDGET;

/// Consecutive quiescent polls required before the run is declared complete.
const REQUIRED_CONFIRMATIONS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Completed,
    Interrupted,
    /// A component the run cannot continue without has stopped.
    Halted(String),
}

/// Global completion: nothing left to enqueue, every queue empty, every worker idle.
pub fn is_quiescent(
    remaining_budget: i64,
    depths: &QueueDepths,
    registry: &WorkerRegistry,
) -> bool {
    remaining_budget <= 0 && depths.all_empty() && registry.all_idle()
}

/// Polls budget, queue depths, and idle flags until the run completes, halts, or is interrupted.
pub struct QuiescenceMonitor {
    queues: PipelineQueues,
    registry: Arc<WorkerRegistry>,
    progress: Arc<RunProgress>,
    poll_interval: Duration,
    status_interval: Duration,
    shutdown: CancellationToken,
}

impl QuiescenceMonitor {
    pub fn new(
        queues: PipelineQueues,
        registry: Arc<WorkerRegistry>,
        progress: Arc<RunProgress>,
        poll_interval: Duration,
        status_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queues,
            registry,
            progress,
            poll_interval,
            status_interval,
            shutdown,
        }
    }

    pub async fn run(self) -> MonitorExit {
        let mut confirmations = 0;
        let mut last_status = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return MonitorExit::Interrupted,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let budget = self.progress.remaining_budget();
            let depths = self.queues.depths();
            self.update_gauges(budget, &depths);

            if last_status.elapsed() >= self.status_interval {
                self.report_status(budget, &depths);
                last_status = Instant::now();
            }

            if !self.registry.writer().is_alive() {
                return MonitorExit::Halted("result writer stopped".to_string());
            }
            if let Some(role) = self.registry.dead_fetcher_pool() {
                return MonitorExit::Halted(format!("every {role} worker stopped"));
            }

            if is_quiescent(budget, &depths, &self.registry) {
                confirmations += 1;
                if confirmations >= REQUIRED_CONFIRMATIONS {
                    self.report_status(budget, &depths);
                    return MonitorExit::Completed;
                }
            } else {
                confirmations = 0;
            }
        }
    }

    fn update_gauges(&self, budget: i64, depths: &QueueDepths) {
        let Some(metrics) = HARVEST_METRICS.get() else {
            return;
        };
        metrics.remaining_budget.set(display_budget(budget));
        metrics.task_queue_depth.set(depths.tasks as i64);
        metrics.retry_queue_depth.set(depths.retries as i64);
        metrics.cover_job_depth.set(depths.cover_jobs as i64);
        metrics.avatar_job_depth.set(depths.avatar_jobs as i64);
        metrics.comment_job_depth.set(depths.comment_jobs as i64);
        metrics.result_queue_depth.set(
            (depths.item_results
                + depths.owner_results
                + depths.covers_stored
                + depths.avatars_stored
                + depths.comment_results) as i64,
        );
        metrics.busy_workers.set(self.registry.busy_count() as i64);
    }

    fn report_status(&self, budget: i64, depths: &QueueDepths) {
        let budget = display_budget(budget);
        tracing::info!(
            event = "harvest_status",
            remaining_budget = budget,
            tasks = depths.tasks,
            retries = depths.retries,
            cover_jobs = depths.cover_jobs,
            avatar_jobs = depths.avatar_jobs,
            comment_jobs = depths.comment_jobs,
            busy_workers = self.registry.busy_count(),
            "outstanding work"
        );
        println!(
            "budget {:>8} | tasks {:>6} | retries {:>6} | covers {:>6} | avatars {:>6} | comments {:>6}",
            budget,
            depths.tasks,
            depths.retries,
            depths.cover_jobs,
            depths.avatar_jobs,
            depths.comment_jobs
        );
    }
}

fn display_budget(budget: i64) -> i64 {
    if budget == UNLIMITED_BUDGET {
        -1
    } else {
        budget.max(0)
    }
}
