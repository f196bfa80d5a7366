use std::sync::Arc;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use futures::future::BoxFuture;

use crate::db::{OutstandingRows, SqliteStore, StoreError, StoreWrite};

use super::types::{CommentJob, OutstandingWork, PersistError, PictureJob};

/// The writer's view of the store.
///
/// Abstracted so commit retry and fatal-store handling can be tested without a database.
pub trait HarvestStore: Send + Sync {
    fn count_items<'a>(&'a self) -> BoxFuture<'a, Result<i64, PersistError>>;

    fn read_checkpoint<'a>(&'a self) -> BoxFuture<'a, Result<Option<i64>, PersistError>>;

    fn load_outstanding<'a>(&'a self) -> BoxFuture<'a, Result<OutstandingWork, PersistError>>;

    /// Applies every write in one transaction.
    fn apply_batch<'a>(
        &'a self,
        writes: &'a [StoreWrite],
    ) -> BoxFuture<'a, Result<(), PersistError>>;
}

impl<T> HarvestStore for Arc<T>
where
    T: HarvestStore + ?Sized,
{
    fn count_items<'a>(&'a self) -> BoxFuture<'a, Result<i64, PersistError>> {
        (**self).count_items()
    }

    fn read_checkpoint<'a>(&'a self) -> BoxFuture<'a, Result<Option<i64>, PersistError>> {
        (**self).read_checkpoint()
    }

    fn load_outstanding<'a>(&'a self) -> BoxFuture<'a, Result<OutstandingWork, PersistError>> {
        (**self).load_outstanding()
    }

    fn apply_batch<'a>(
        &'a self,
        writes: &'a [StoreWrite],
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        (**self).apply_batch(writes)
    }
}

impl HarvestStore for SqliteStore {
    fn count_items<'a>(&'a self) -> BoxFuture<'a, Result<i64, PersistError>> {
        Box::pin(async move { SqliteStore::count_items(self).await.map_err(map_store_error) })
    }

    fn read_checkpoint<'a>(&'a self) -> BoxFuture<'a, Result<Option<i64>, PersistError>> {
        Box::pin(async move { SqliteStore::read_checkpoint(self).await.map_err(map_store_error) })
    }

    fn load_outstanding<'a>(&'a self) -> BoxFuture<'a, Result<OutstandingWork, PersistError>> {
        Box::pin(async move {
            SqliteStore::load_outstanding(self)
                .await
                .map(outstanding_work)
                .map_err(map_store_error)
        })
    }

    fn apply_batch<'a>(
        &'a self,
        writes: &'a [StoreWrite],
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            SqliteStore::apply_batch(self, writes.to_vec())
                .await
                .map_err(map_store_error)
        })
    }
}

/// Turns raw outstanding rows into the jobs the writer seeds at startup.
pub fn outstanding_work(rows: OutstandingRows) -> OutstandingWork {
    OutstandingWork {
        cover_jobs: rows
            .missing_covers
            .into_iter()
            .map(|(item_id, cover_ref)| PictureJob::cover(item_id, cover_ref))
            .collect(),
        avatar_jobs: rows
            .missing_avatars
            .into_iter()
            .map(|(owner_id, avatar_ref)| PictureJob::avatar(owner_id, avatar_ref))
            .collect(),
        comment_jobs: rows
            .missing_comments
            .into_iter()
            .map(|item_id| CommentJob { item_id })
            .collect(),
    }
}

pub fn map_store_error(error: StoreError) -> PersistError {
    match error {
        StoreError::Query(err) => map_diesel_error(err),
        StoreError::Join(err) => PersistError::retryable(format!("store task join error: {err}")),
        StoreError::CorruptCheckpoint(page) => {
            PersistError::fatal(format!("corrupt checkpoint: page {page}"))
        }
        other => PersistError::fatal(other.to_string()),
    }
}

pub fn map_diesel_error(error: DieselError) -> PersistError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => PersistError::retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            // SQLite reports lock contention without a dedicated kind.
            _ if is_lock_contention(info.message()) => PersistError::retryable(format!(
                "database busy ({kind:?}): {}",
                info.message()
            )),
            _ => PersistError::fatal(format!(
                "fatal database error ({kind:?}): {}",
                info.message()
            )),
        },
        DieselError::RollbackTransaction => {
            PersistError::retryable("transaction rollback requested by database".to_string())
        }
        other => PersistError::fatal(format!("fatal diesel error: {other}")),
    }
}

fn is_lock_contention(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database table is locked")
}
