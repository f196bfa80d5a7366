use std::sync::Arc;

use futures::future::BoxFuture;

use super::types::{CommentPage, DetailOutcome, FetchError, ListingEntry, TaskDescriptor};

// These traits exist so worker loops can be tested against scripted failures without network
// access. Each has a blanket impl for `Arc<T>` so pools can share one source.

/// Fetches one page of the remote catalog listing.
pub trait ListingFetcher: Send + Sync {
    fn fetch_listing<'a>(
        &'a self,
        page_number: i64,
    ) -> BoxFuture<'a, Result<Vec<ListingEntry>, FetchError>>;
}

/// Fetches and parses one item's detail page.
pub trait DetailFetcher: Send + Sync {
    fn fetch_detail<'a>(
        &'a self,
        task: &'a TaskDescriptor,
    ) -> BoxFuture<'a, Result<DetailOutcome, FetchError>>;
}

/// Downloads the raw bytes of one picture. Integrity checks happen in the media worker.
pub trait PictureFetcher: Send + Sync {
    fn fetch_picture<'a>(
        &'a self,
        remote_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, FetchError>>;
}

/// Fetches the first page of replies for one item.
pub trait CommentFetcher: Send + Sync {
    fn fetch_comments<'a>(&'a self, item_id: i64) -> BoxFuture<'a, Result<CommentPage, FetchError>>;
}

impl<T> ListingFetcher for Arc<T>
where
    T: ListingFetcher + ?Sized,
{
    fn fetch_listing<'a>(
        &'a self,
        page_number: i64,
    ) -> BoxFuture<'a, Result<Vec<ListingEntry>, FetchError>> {
        (**self).fetch_listing(page_number)
    }
}

impl<T> DetailFetcher for Arc<T>
where
    T: DetailFetcher + ?Sized,
{
    fn fetch_detail<'a>(
        &'a self,
        task: &'a TaskDescriptor,
    ) -> BoxFuture<'a, Result<DetailOutcome, FetchError>> {
        (**self).fetch_detail(task)
    }
}

impl<T> PictureFetcher for Arc<T>
where
    T: PictureFetcher + ?Sized,
{
    fn fetch_picture<'a>(
        &'a self,
        remote_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        (**self).fetch_picture(remote_ref)
    }
}

impl<T> CommentFetcher for Arc<T>
where
    T: CommentFetcher + ?Sized,
{
    fn fetch_comments<'a>(
        &'a self,
        item_id: i64,
    ) -> BoxFuture<'a, Result<CommentPage, FetchError>> {
        (**self).fetch_comments(item_id)
    }
}
