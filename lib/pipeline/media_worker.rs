use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use image::{ImageReader, Limits};
use tokio_util::sync::CancellationToken;

use crate::server::monitoring::HARVEST_METRICS;

use super::error::Error;
use super::fetcher::PictureFetcher;
use super::flags::WorkerFlag;
use super::queues::{recv_prioritized, PipelineQueues, Received};
use super::types::{FetchError, FetchErrorKind, PictureDirs, PictureJob, PictureKind};

const FALLBACK_EXTENSION: &str = "jpg";

/// Downloads covers and avatars, verifies them, and writes them under the picture directories.
pub struct MediaWorker<F> {
    fetcher: F,
    queues: PipelineQueues,
    flag: WorkerFlag,
    dirs: PictureDirs,
    max_dimension: u32,
    poll_wait: Duration,
    shutdown: CancellationToken,
}

impl<F> MediaWorker<F>
where
    F: PictureFetcher,
{
    pub fn new(
        fetcher: F,
        queues: PipelineQueues,
        flag: WorkerFlag,
        dirs: PictureDirs,
        max_dimension: u32,
        poll_wait: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            queues,
            flag,
            dirs,
            max_dimension,
            poll_wait,
            shutdown,
        }
    }

    /// Serves item covers first; owner avatars only when no cover job is waiting.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let job = match recv_prioritized(
                &self.queues.cover_jobs.rx,
                &self.queues.avatar_jobs.rx,
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

    async fn process(&self, job: PictureJob) -> Result<(), Error> {
        match self.store_picture(&job).await {
            Ok(path) => {
                tracing::info!(
                    event = "picture_stored",
                    kind = job.kind.as_str(),
                    subject_id = job.subject_id,
                    path = %path.display(),
                    "picture verified and stored"
                );
                self.queues.pictures_stored(job.kind).push(job.subject_id);
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                if let Some(metrics) = HARVEST_METRICS.get() {
                    metrics.requeues_total.inc();
                }
                if err.kind == FetchErrorKind::Integrity {
                    tracing::warn!(
                        event = "picture_integrity_failed",
                        kind = job.kind.as_str(),
                        subject_id = job.subject_id,
                        error = %err,
                        "picture failed verification, requeued"
                    );
                } else {
                    tracing::debug!(
                        event = "picture_fetch_requeued",
                        kind = job.kind.as_str(),
                        subject_id = job.subject_id,
                        error = %err,
                        "picture fetch failed, requeued"
                    );
                }
                self.queues.picture_jobs(job.kind).push(job);
                Ok(())
            }
            Err(err) => {
                let unit = format!("{} picture {}", job.kind.as_str(), job.subject_id);
                self.queues.picture_jobs(job.kind).push(job);
                Err(Error::WorkerFatal {
                    role: self.flag.role(),
                    index: self.flag.index(),
                    unit,
                    source: err,
                })
            }
        }
    }

    async fn store_picture(&self, job: &PictureJob) -> Result<PathBuf, FetchError> {
        let bytes = self.fetcher.fetch_picture(&job.remote_ref).await?;

        let max_dimension = self.max_dimension;
        let bytes = tokio::task::spawn_blocking(move || {
            verify_picture(&bytes, max_dimension).map(|_| bytes)
        })
        .await
        .map_err(|err| {
            FetchError::new(FetchErrorKind::Other, format!("verify task failed: {err}"))
        })??;

        let path = picture_path(&self.dirs, job);
        tokio::fs::write(&path, &bytes).await.map_err(|err| {
            FetchError::new(
                FetchErrorKind::Other,
                format!("failed to write {}: {err}", path.display()),
            )
        })?;
        Ok(path)
    }
}

/// Decodes the picture under dimension limits. Any failure is an integrity failure.
pub fn verify_picture(bytes: &[u8], max_dimension: u32) -> Result<(u32, u32), FetchError> {
    let integrity = |err: &dyn std::fmt::Display| {
        FetchError::new(FetchErrorKind::Integrity, format!("picture failed verification: {err}"))
    };

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| integrity(&err))?;
    let mut limits = Limits::default();
    limits.max_image_width = Some(max_dimension);
    limits.max_image_height = Some(max_dimension);
    reader.limits(limits);

    let image = reader.decode().map_err(|err| integrity(&err))?;
    Ok((image.width(), image.height()))
}

/// `<dir>/<subject_id>.<ext>`, with the extension taken from the remote reference.
pub fn picture_path(dirs: &PictureDirs, job: &PictureJob) -> PathBuf {
    dirs.for_kind(job.kind)
        .join(format!("{}.{}", job.subject_id, picture_extension(&job.remote_ref)))
}

pub fn picture_extension(remote_ref: &str) -> &str {
    let without_query = remote_ref
        .split(['?', '#'])
        .next()
        .unwrap_or(remote_ref);
    let file_name = without_query.rsplit('/').next().unwrap_or(without_query);
    match file_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext,
        _ => FALLBACK_EXTENSION,
    }
}

pub(crate) fn ensure_picture_dirs(dirs: &PictureDirs) -> std::io::Result<()> {
    for kind in [PictureKind::Item, PictureKind::Owner] {
        std::fs::create_dir_all(dirs.for_kind(kind))?;
    }
    Ok(())
}
