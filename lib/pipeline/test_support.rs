use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::db::sqlite_test::{sample_item, sample_owner};
use crate::db::StoreWrite;
use crate::retry::RetryPolicy;

use super::fetcher::{CommentFetcher, DetailFetcher, ListingFetcher, PictureFetcher};
use super::persister::HarvestStore;
use super::types::{
    CommentPage, DetailOutcome, FetchError, FetchErrorKind, ListingEntry, OutstandingWork,
    PersistError, PictureDirs, PipelineConfig, TaskDescriptor,
};

/// Pipeline pacing shrunk to milliseconds so end-to-end runs finish quickly.
pub(crate) fn test_pipeline_config(
    picture_dirs: PictureDirs,
    item_budget: Option<i64>,
) -> PipelineConfig {
    PipelineConfig {
        detail_workers: 2,
        media_workers: 3,
        comment_workers: 2,
        task_queue_capacity: 4,
        start_page: 1,
        item_budget,
        poll_wait: Duration::from_millis(10),
        listing_retry_delay: Duration::from_millis(1),
        writer_interval: Duration::from_millis(5),
        monitor_interval: Duration::from_millis(10),
        status_interval: Duration::from_secs(3600),
        commit_every: 3,
        commit_retry: RetryPolicy::constant(3, Duration::ZERO),
        max_image_dimension: 64,
        picture_dirs,
    }
}

pub(crate) fn entries(item_ids: &[i64]) -> Vec<ListingEntry> {
    item_ids
        .iter()
        .map(|&item_id| ListingEntry {
            item_id,
            item_key: format!("BV{item_id:010}"),
            content_id: item_id * 10,
        })
        .collect()
}

pub(crate) fn task(item_id: i64, page_number: i64) -> TaskDescriptor {
    TaskDescriptor {
        item_id,
        item_key: format!("BV{item_id:010}"),
        content_id: item_id * 10,
        page_number,
    }
}

pub(crate) fn found(item_id: i64, owner_id: i64) -> DetailOutcome {
    DetailOutcome::Found {
        item: sample_item(item_id, owner_id),
        owner: sample_owner(owner_id),
    }
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode test png");
    buffer.into_inner()
}

/// Scripted responses keyed by request, shared between clones so tests can keep a handle.
struct Script<K, T> {
    plans: Mutex<HashMap<K, VecDeque<Result<T, FetchError>>>>,
    calls: Mutex<Vec<K>>,
    fallback: Option<T>,
}

impl<K, T> Script<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    T: Clone,
{
    fn new(plan: Vec<(K, Vec<Result<T, FetchError>>)>, fallback: Option<T>) -> Arc<Self> {
        let plans = plan
            .into_iter()
            .map(|(key, responses)| (key, responses.into_iter().collect()))
            .collect();
        Arc::new(Self {
            plans: Mutex::new(plans),
            calls: Mutex::new(Vec::new()),
            fallback,
        })
    }

    fn next(&self, key: &K) -> Result<T, FetchError> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(key.clone());

        let scripted = self
            .plans
            .lock()
            .expect("plans mutex poisoned")
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        match (scripted, &self.fallback) {
            (Some(response), _) => response,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(FetchError::new(
                FetchErrorKind::Other,
                format!("no scripted response for {key:?}"),
            )),
        }
    }

    fn call_order(&self) -> Vec<K> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    fn calls_for(&self, key: &K) -> u32 {
        self.call_order().iter().filter(|call| *call == key).count() as u32
    }
}

/// Listing pages by page number. Unscripted pages are empty, which ends the catalog.
#[derive(Clone)]
pub(crate) struct MockListing {
    script: Arc<Script<i64, Vec<ListingEntry>>>,
}

impl MockListing {
    pub(crate) fn with_pages(
        pages: Vec<(i64, Vec<Result<Vec<ListingEntry>, FetchError>>)>,
    ) -> Self {
        Self {
            script: Script::new(pages, Some(Vec::new())),
        }
    }

    pub(crate) fn calls_handle(&self) -> Self {
        self.clone()
    }

    pub(crate) fn calls_for(&self, page_number: i64) -> u32 {
        self.script.calls_for(&page_number)
    }
}

impl ListingFetcher for MockListing {
    fn fetch_listing<'a>(
        &'a self,
        page_number: i64,
    ) -> BoxFuture<'a, Result<Vec<ListingEntry>, FetchError>> {
        Box::pin(async move { self.script.next(&page_number) })
    }
}

#[derive(Clone)]
pub(crate) struct MockDetail {
    script: Arc<Script<i64, DetailOutcome>>,
}

impl MockDetail {
    pub(crate) fn with_plan(plan: Vec<(i64, Vec<Result<DetailOutcome, FetchError>>)>) -> Self {
        Self {
            script: Script::new(plan, None),
        }
    }

    pub(crate) fn call_order(&self) -> Vec<i64> {
        self.script.call_order()
    }

    pub(crate) fn calls_for(&self, item_id: i64) -> u32 {
        self.script.calls_for(&item_id)
    }
}

impl DetailFetcher for MockDetail {
    fn fetch_detail<'a>(
        &'a self,
        task: &'a TaskDescriptor,
    ) -> BoxFuture<'a, Result<DetailOutcome, FetchError>> {
        Box::pin(async move { self.script.next(&task.item_id) })
    }
}

/// Pictures keyed by remote reference.
#[derive(Clone)]
pub(crate) struct MockPictures {
    script: Arc<Script<String, Vec<u8>>>,
}

impl MockPictures {
    /// Serves a small valid PNG for every reference.
    pub(crate) fn serving_png() -> Self {
        Self {
            script: Script::new(Vec::new(), Some(png_bytes(2, 2))),
        }
    }

    pub(crate) fn with_plan(plan: Vec<(&str, Vec<Result<Vec<u8>, FetchError>>)>) -> Self {
        let plan = plan
            .into_iter()
            .map(|(remote_ref, responses)| (remote_ref.to_string(), responses))
            .collect();
        Self {
            script: Script::new(plan, None),
        }
    }

    pub(crate) fn call_order(&self) -> Vec<String> {
        self.script.call_order()
    }
}

impl PictureFetcher for MockPictures {
    fn fetch_picture<'a>(
        &'a self,
        remote_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move { self.script.next(&remote_ref.to_string()) })
    }
}

#[derive(Clone)]
pub(crate) struct MockComments {
    script: Arc<Script<i64, CommentPage>>,
}

impl MockComments {
    /// Answers every item with the same page.
    pub(crate) fn always(page: CommentPage) -> Self {
        Self {
            script: Script::new(Vec::new(), Some(page)),
        }
    }

    pub(crate) fn with_plan(plan: Vec<(i64, Vec<Result<CommentPage, FetchError>>)>) -> Self {
        Self {
            script: Script::new(plan, None),
        }
    }

    pub(crate) fn calls_for(&self, item_id: i64) -> u32 {
        self.script.calls_for(&item_id)
    }
}

impl CommentFetcher for MockComments {
    fn fetch_comments<'a>(
        &'a self,
        item_id: i64,
    ) -> BoxFuture<'a, Result<CommentPage, FetchError>> {
        Box::pin(async move { self.script.next(&item_id) })
    }
}

/// In-memory store double that records committed batches and can fail commits on demand.
#[derive(Clone, Default)]
pub(crate) struct FlakyStore {
    state: Arc<FlakyStoreState>,
}

#[derive(Default)]
struct FlakyStoreState {
    outcomes: Mutex<VecDeque<Result<(), PersistError>>>,
    calls: Mutex<u32>,
    batches: Mutex<Vec<Vec<StoreWrite>>>,
}

impl FlakyStore {
    pub(crate) fn with_outcomes(outcomes: Vec<Result<(), PersistError>>) -> Self {
        let store = Self::default();
        *store
            .state
            .outcomes
            .lock()
            .expect("outcomes mutex poisoned") = outcomes.into_iter().collect();
        store
    }

    pub(crate) fn calls(&self) -> u32 {
        *self.state.calls.lock().expect("calls mutex poisoned")
    }

    pub(crate) fn batches(&self) -> Vec<Vec<StoreWrite>> {
        self.state
            .batches
            .lock()
            .expect("batches mutex poisoned")
            .clone()
    }
}

impl HarvestStore for FlakyStore {
    fn count_items<'a>(&'a self) -> BoxFuture<'a, Result<i64, PersistError>> {
        Box::pin(async move { Ok(0) })
    }

    fn read_checkpoint<'a>(&'a self) -> BoxFuture<'a, Result<Option<i64>, PersistError>> {
        Box::pin(async move { Ok(None) })
    }

    fn load_outstanding<'a>(&'a self) -> BoxFuture<'a, Result<OutstandingWork, PersistError>> {
        Box::pin(async move { Ok(OutstandingWork::default()) })
    }

    fn apply_batch<'a>(
        &'a self,
        writes: &'a [StoreWrite],
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            *self.state.calls.lock().expect("calls mutex poisoned") += 1;

            let next = self
                .state
                .outcomes
                .lock()
                .expect("outcomes mutex poisoned")
                .pop_front()
                .unwrap_or(Ok(()));

            if next.is_ok() {
                self.state
                    .batches
                    .lock()
                    .expect("batches mutex poisoned")
                    .push(writes.to_vec());
            }
            next
        })
    }
}
