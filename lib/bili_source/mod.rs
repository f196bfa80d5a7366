pub mod error_mapping;
pub mod extract;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::fetch_client::FetchClient;
use crate::pipeline::fetcher::{CommentFetcher, DetailFetcher, ListingFetcher, PictureFetcher};
use crate::pipeline::types::{
    unix_now, CommentPage, DetailOutcome, FetchError, ListingEntry, TaskDescriptor,
};

use error_mapping::{map_client_error, map_extract_error};
pub use extract::{DetailExtractor, ExtractError};

/// Items per listing page.
pub const LISTING_PAGE_SIZE: u32 = 50;

/// Base URLs and catalog selection for the remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiliEndpoints {
    /// Prefix for the listing and comment APIs, ending with `/`.
    pub api_url: String,
    /// Prefix for detail pages; the item key is appended verbatim.
    pub video_url: String,
    pub category_id: i64,
}

impl BiliEndpoints {
    fn listing_url(&self) -> String {
        format!("{}web-interface/newlist", self.api_url)
    }

    fn comments_url(&self) -> String {
        format!("{}v2/reply/main", self.api_url)
    }

    fn detail_url(&self, item_key: &str) -> String {
        format!("{}{}", self.video_url, item_key)
    }
}

/// Production source adapter: every fetcher trait over one shared `FetchClient`.
pub struct BiliSource {
    client: Arc<FetchClient>,
    endpoints: BiliEndpoints,
    extractor: DetailExtractor,
}

impl BiliSource {
    pub fn new(client: Arc<FetchClient>, endpoints: BiliEndpoints) -> Result<Self, ExtractError> {
        Ok(Self {
            client,
            endpoints,
            extractor: DetailExtractor::new()?,
        })
    }
}

impl ListingFetcher for BiliSource {
    fn fetch_listing<'a>(
        &'a self,
        page_number: i64,
    ) -> BoxFuture<'a, Result<Vec<ListingEntry>, FetchError>> {
        Box::pin(async move {
            let params = [
                ("rid", self.endpoints.category_id.to_string()),
                ("pn", page_number.to_string()),
                ("ps", LISTING_PAGE_SIZE.to_string()),
            ];
            // Listing requests always go direct.
            let response = self
                .client
                .fetch(&self.endpoints.listing_url(), &params, false)
                .await
                .map_err(map_client_error)?;
            extract::parse_listing(&response.body).map_err(map_extract_error)
        })
    }
}

impl DetailFetcher for BiliSource {
    fn fetch_detail<'a>(
        &'a self,
        task: &'a TaskDescriptor,
    ) -> BoxFuture<'a, Result<DetailOutcome, FetchError>> {
        Box::pin(async move {
            let response = self
                .client
                .fetch_proxied(&self.endpoints.detail_url(&task.item_key), &[])
                .await
                .map_err(map_client_error)?;
            self.extractor
                .parse_detail(&response.text(), unix_now())
                .map_err(map_extract_error)
        })
    }
}

impl PictureFetcher for BiliSource {
    fn fetch_picture<'a>(
        &'a self,
        remote_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move {
            let response = self
                .client
                .fetch_proxied(remote_ref, &[])
                .await
                .map_err(map_client_error)?;
            Ok(response.body)
        })
    }
}

impl CommentFetcher for BiliSource {
    fn fetch_comments<'a>(
        &'a self,
        item_id: i64,
    ) -> BoxFuture<'a, Result<CommentPage, FetchError>> {
        Box::pin(async move {
            let params = [
                ("oid", item_id.to_string()),
                ("next", "0".to_string()),
                ("type", "1".to_string()),
                ("mode", "3".to_string()),
            ];
            let response = self
                .client
                .fetch_proxied(&self.endpoints.comments_url(), &params)
                .await
                .map_err(map_client_error)?;
            Ok(extract::parse_comments(&response.body))
        })
    }
}
