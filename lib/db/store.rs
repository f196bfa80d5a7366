use std::path::Path;
use std::sync::{Arc, Mutex};

use diesel::connection::SimpleConnection;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel::sqlite::SqliteConnection;
use diesel::upsert::excluded;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;
use tokio::task::JoinError;

use super::models::{CheckpointRow, CommentRecord, ItemRecord, OwnerRecord};
use super::schema::{checkpoint, comments, items, owners};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open sqlite database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error(transparent)]
    Query(#[from] diesel::result::Error),

    #[error("failed to run store migrations: {0}")]
    Migration(String),

    #[error("checkpoint row holds invalid page number {0}")]
    CorruptCheckpoint(i64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("store connection mutex poisoned")]
    Poisoned,

    #[error("store task join error: {0}")]
    Join(#[from] JoinError),
}

/// One store mutation issued by the result writer.
///
/// Writes are buffered by the writer and applied in order inside a single transaction per batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    UpsertItem(ItemRecord),
    UpsertOwner(OwnerRecord),
    UpsertComment(CommentRecord),
    MarkCoverStored(i64),
    MarkAvatarStored(i64),
    AdvanceCheckpoint(i64),
}

/// Raw rows describing work that was derived but never finished in a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutstandingRows {
    /// `(item_id, cover_ref)` for items without a verified local cover.
    pub missing_covers: Vec<(i64, String)>,
    /// `(owner_id, avatar_ref)` for owners without a verified local avatar.
    pub missing_avatars: Vec<(i64, String)>,
    /// Items that have no comment row yet.
    pub missing_comments: Vec<i64>,
}

pub fn configure_connection(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    conn.batch_execute(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

pub fn run_migrations(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| StoreError::Migration(err.to_string()))?;
    Ok(())
}

/// Inserts or overwrites one item row.
///
/// `has_local_cover` is only written on first insert; a re-ingest never clears a cover that is
/// already verified on disk.
pub fn upsert_item(conn: &mut SqliteConnection, record: &ItemRecord) -> Result<(), StoreError> {
    diesel::insert_into(items::table)
        .values(record)
        .on_conflict(items::item_id)
        .do_update()
        .set((
            items::item_key.eq(excluded(items::item_key)),
            items::content_id.eq(excluded(items::content_id)),
            items::cover_ref.eq(excluded(items::cover_ref)),
            items::title.eq(excluded(items::title)),
            items::description.eq(excluded(items::description)),
            items::keywords.eq(excluded(items::keywords)),
            items::flags.eq(excluded(items::flags)),
            items::duration.eq(excluded(items::duration)),
            items::part_count.eq(excluded(items::part_count)),
            items::publish_time.eq(excluded(items::publish_time)),
            items::view_count.eq(excluded(items::view_count)),
            items::comment_count.eq(excluded(items::comment_count)),
            items::like_count.eq(excluded(items::like_count)),
            items::coin_count.eq(excluded(items::coin_count)),
            items::favorite_count.eq(excluded(items::favorite_count)),
            items::share_count.eq(excluded(items::share_count)),
            items::reply_count.eq(excluded(items::reply_count)),
            items::owner_id.eq(excluded(items::owner_id)),
            items::ingest_time.eq(excluded(items::ingest_time)),
        ))
        .execute(conn)?;
    Ok(())
}

/// Inserts or overwrites one owner row, leaving `has_local_avatar` untouched on conflict.
pub fn upsert_owner(conn: &mut SqliteConnection, record: &OwnerRecord) -> Result<(), StoreError> {
    diesel::insert_into(owners::table)
        .values(record)
        .on_conflict(owners::owner_id)
        .do_update()
        .set((
            owners::name.eq(excluded(owners::name)),
            owners::sex.eq(excluded(owners::sex)),
            owners::avatar_ref.eq(excluded(owners::avatar_ref)),
            owners::bio.eq(excluded(owners::bio)),
            owners::level.eq(excluded(owners::level)),
            owners::following_count.eq(excluded(owners::following_count)),
            owners::fan_count.eq(excluded(owners::fan_count)),
            owners::ingest_time.eq(excluded(owners::ingest_time)),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn upsert_comment(
    conn: &mut SqliteConnection,
    record: &CommentRecord,
) -> Result<(), StoreError> {
    diesel::insert_into(comments::table)
        .values(record)
        .on_conflict(comments::item_id)
        .do_update()
        .set((
            comments::messages.eq(excluded(comments::messages)),
            comments::ingest_time.eq(excluded(comments::ingest_time)),
        ))
        .execute(conn)?;
    Ok(())
}

/// Moves the checkpoint forward to `page_number`; an older page never rewinds it.
pub fn advance_checkpoint(conn: &mut SqliteConnection, page_number: i64) -> Result<(), StoreError> {
    diesel::insert_into(checkpoint::table)
        .values(&CheckpointRow::at_page(page_number))
        .on_conflict(checkpoint::id)
        .do_update()
        .set(checkpoint::page_number.eq(sql::<BigInt>(
            "MAX(checkpoint.page_number, excluded.page_number)",
        )))
        .execute(conn)?;
    Ok(())
}

pub fn mark_cover_stored(conn: &mut SqliteConnection, item_id: i64) -> Result<(), StoreError> {
    diesel::update(items::table.find(item_id))
        .set(items::has_local_cover.eq(true))
        .execute(conn)?;
    Ok(())
}

pub fn mark_avatar_stored(conn: &mut SqliteConnection, owner_id: i64) -> Result<(), StoreError> {
    diesel::update(owners::table.find(owner_id))
        .set(owners::has_local_avatar.eq(true))
        .execute(conn)?;
    Ok(())
}

pub fn apply_write(conn: &mut SqliteConnection, write: &StoreWrite) -> Result<(), StoreError> {
    match write {
        StoreWrite::UpsertItem(record) => upsert_item(conn, record),
        StoreWrite::UpsertOwner(record) => upsert_owner(conn, record),
        StoreWrite::UpsertComment(record) => upsert_comment(conn, record),
        StoreWrite::MarkCoverStored(item_id) => mark_cover_stored(conn, *item_id),
        StoreWrite::MarkAvatarStored(owner_id) => mark_avatar_stored(conn, *owner_id),
        StoreWrite::AdvanceCheckpoint(page_number) => advance_checkpoint(conn, *page_number),
    }
}

/// Applies all writes in order inside one transaction. Either every write lands or none does.
pub fn apply_batch(conn: &mut SqliteConnection, writes: &[StoreWrite]) -> Result<(), StoreError> {
    if writes.is_empty() {
        return Ok(());
    }
    conn.transaction::<_, StoreError, _>(|conn| {
        for write in writes {
            apply_write(conn, write)?;
        }
        Ok(())
    })
}

/// Reads the pagination checkpoint, rejecting rows that cannot be a real page.
pub fn read_checkpoint(conn: &mut SqliteConnection) -> Result<Option<i64>, StoreError> {
    let page = checkpoint::table
        .find(CheckpointRow::SINGLETON_ID)
        .select(checkpoint::page_number)
        .first::<i64>(conn)
        .optional()?;

    match page {
        Some(page_number) if page_number <= 0 => Err(StoreError::CorruptCheckpoint(page_number)),
        other => Ok(other),
    }
}

pub fn count_items(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    Ok(items::table.count().get_result::<i64>(conn)?)
}

pub fn load_outstanding(conn: &mut SqliteConnection) -> Result<OutstandingRows, StoreError> {
    let missing_covers = items::table
        .filter(items::has_local_cover.eq(false))
        .order(items::item_id.asc())
        .select((items::item_id, items::cover_ref))
        .load::<(i64, String)>(conn)?;

    let missing_avatars = owners::table
        .filter(owners::has_local_avatar.eq(false))
        .order(owners::owner_id.asc())
        .select((owners::owner_id, owners::avatar_ref))
        .load::<(i64, String)>(conn)?;

    let missing_comments = items::table
        .filter(items::item_id.ne_all(comments::table.select(comments::item_id)))
        .order(items::item_id.asc())
        .select(items::item_id)
        .load::<i64>(conn)?;

    Ok(OutstandingRows {
        missing_covers,
        missing_avatars,
        missing_comments,
    })
}

pub fn load_item(
    conn: &mut SqliteConnection,
    item_id: i64,
) -> Result<Option<ItemRecord>, StoreError> {
    Ok(items::table
        .find(item_id)
        .select(ItemRecord::as_select())
        .first(conn)
        .optional()?)
}

pub fn load_owner(
    conn: &mut SqliteConnection,
    owner_id: i64,
) -> Result<Option<OwnerRecord>, StoreError> {
    Ok(owners::table
        .find(owner_id)
        .select(OwnerRecord::as_select())
        .first(conn)
        .optional()?)
}

pub fn load_comment(
    conn: &mut SqliteConnection,
    item_id: i64,
) -> Result<Option<CommentRecord>, StoreError> {
    Ok(comments::table
        .find(item_id)
        .select(CommentRecord::as_select())
        .first(conn)
        .optional()?)
}

/// SQLite-backed store shared between the coordinator (startup reads) and the result writer.
///
/// Diesel's SQLite connection is synchronous, so every operation runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and applies pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::establish(&path.to_string_lossy())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::establish(":memory:")
    }

    fn establish(database_url: &str) -> Result<Self, StoreError> {
        let mut conn = SqliteConnection::establish(database_url)?;
        configure_connection(&mut conn)?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn run_op<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&mut guard)
        })
        .await?
    }

    pub async fn count_items(&self) -> Result<i64, StoreError> {
        self.run_op(count_items).await
    }

    pub async fn read_checkpoint(&self) -> Result<Option<i64>, StoreError> {
        self.run_op(read_checkpoint).await
    }

    pub async fn load_outstanding(&self) -> Result<OutstandingRows, StoreError> {
        self.run_op(load_outstanding).await
    }

    pub async fn apply_batch(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError> {
        self.run_op(move |conn| apply_batch(conn, &writes)).await
    }

    pub async fn load_item(&self, item_id: i64) -> Result<Option<ItemRecord>, StoreError> {
        self.run_op(move |conn| load_item(conn, item_id)).await
    }

    pub async fn load_owner(&self, owner_id: i64) -> Result<Option<OwnerRecord>, StoreError> {
        self.run_op(move |conn| load_owner(conn, owner_id)).await
    }

    pub async fn load_comment(&self, item_id: i64) -> Result<Option<CommentRecord>, StoreError> {
        self.run_op(move |conn| load_comment(conn, item_id)).await
    }
}
