use std::future::Future;

use thiserror::Error;
use tokio::task::JoinHandle;

use super::error::Error;
use super::flags::{WorkerFlag, WorkerRole};
use crate::server::monitoring::HARVEST_METRICS;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker task joined with an error: {0}")]
    JoinError(String),
    #[error("Worker encountered an error: {0}")]
    WorkerError(#[from] Error),
}

#[derive(Error, Debug)]
pub struct ShutdownError {
    pub role: WorkerRole,
    pub errors: Vec<WorkerError>,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errors while joining {} workers: {:?}", self.role, self.errors)
    }
}

/// Marks the worker exited however its task ends, panics included.
pub(crate) struct ExitGuard(pub(crate) WorkerFlag);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

/// One pool of identical workers, each a spawned task owning one idle flag.
pub struct WorkerPool {
    role: WorkerRole,
    workers: Vec<JoinHandle<Result<(), Error>>>,
}

impl WorkerPool {
    pub fn spawn<F, Fut>(role: WorkerRole, flags: &[WorkerFlag], mut make_worker: F) -> Self
    where
        F: FnMut(WorkerFlag) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let workers = flags
            .iter()
            .cloned()
            .map(|flag| {
                let index = flag.index();
                let guard = ExitGuard(flag.clone());
                let worker = make_worker(flag);
                tokio::spawn(async move {
                    let _guard = guard;
                    let result = worker.await;
                    if let Err(err) = &result {
                        if let Some(metrics) = HARVEST_METRICS.get() {
                            metrics.worker_failures_total.inc();
                        }
                        tracing::error!(
                            event = "worker_failed",
                            worker_role = %role,
                            worker_index = index,
                            error = %err,
                            "worker terminated by fatal error"
                        );
                    }
                    result
                })
            })
            .collect();

        Self { role, workers }
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub async fn wait_for_completion(self) -> Result<(), ShutdownError> {
        let mut errors = vec![];
        for handle in self.workers {
            match handle.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => errors.push(WorkerError::WorkerError(e)),
                Err(e) => errors.push(WorkerError::JoinError(e.to_string())),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError {
                role: self.role,
                errors,
            })
        }
    }
}
