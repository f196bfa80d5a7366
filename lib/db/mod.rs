pub mod models;
pub mod schema;
pub mod store;

pub use models::{CheckpointRow, CommentRecord, ItemRecord, OwnerRecord};
pub use store::{OutstandingRows, SqliteStore, StoreError, StoreWrite};
