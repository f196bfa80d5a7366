use diesel::prelude::*;

/// One catalog entry as persisted in `items`.
///
/// Detail fetchers build this directly from a parsed detail page; the writer upserts it
/// verbatim. `has_local_cover` is always `false` on a freshly built record and is only ever
/// flipped by the writer once a media fetcher reports the cover as stored.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Insertable)]
#[diesel(table_name = super::schema::items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ItemRecord {
    pub item_id: i64,
    pub item_key: String,
    pub content_id: i64,
    pub cover_ref: String,
    pub title: String,
    pub description: String,
    pub keywords: String,
    /// Source-defined copyright/origin flag.
    pub flags: i64,
    /// Seconds.
    pub duration: i64,
    pub part_count: i64,
    /// Unix seconds.
    pub publish_time: i64,
    pub view_count: i64,
    /// Bullet-comment (danmaku) count.
    pub comment_count: i64,
    pub like_count: i64,
    pub coin_count: i64,
    pub favorite_count: i64,
    pub share_count: i64,
    pub reply_count: i64,
    pub owner_id: i64,
    pub has_local_cover: bool,
    /// Unix seconds at which the detail page was parsed.
    pub ingest_time: i64,
}

/// The publishing account of an item, as persisted in `owners`.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Insertable)]
#[diesel(table_name = super::schema::owners)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OwnerRecord {
    pub owner_id: i64,
    pub name: String,
    pub sex: String,
    pub avatar_ref: String,
    pub bio: String,
    pub level: i64,
    pub following_count: i64,
    pub fan_count: i64,
    pub has_local_avatar: bool,
    pub ingest_time: i64,
}

/// First page of replies for one item, stored as a JSON array of message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Insertable)]
#[diesel(table_name = super::schema::comments)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CommentRecord {
    pub item_id: i64,
    pub messages: String,
    pub ingest_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = super::schema::checkpoint)]
pub struct CheckpointRow {
    pub id: i32,
    pub page_number: i64,
}

impl CheckpointRow {
    /// The checkpoint table holds exactly one logical row.
    pub const SINGLETON_ID: i32 = 1;

    pub fn at_page(page_number: i64) -> Self {
        Self {
            id: Self::SINGLETON_ID,
            page_number,
        }
    }
}
