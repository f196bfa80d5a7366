use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::process::Output;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use bili_harvester_lib::db::SqliteStore;
use serde_json::json;
use tokio::process::Command;

const CATEGORY_ID: i64 = 24;

#[derive(Clone, Default)]
struct SourceCounters {
    listing_requests: Arc<AtomicUsize>,
    flaky_detail_failures: Arc<AtomicUsize>,
}

struct MockSource {
    base: String,
    counters: SourceCounters,
}

impl MockSource {
    /// Serves two live items on page 1 and an empty page 2.
    ///
    /// The first request for `BV302` fails with a 502 to exercise the fetch retry path.
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock source");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let counters = SourceCounters::default();

        let app = Router::new()
            .route("/x/web-interface/newlist", get(listing))
            .route("/video/:key", get(detail))
            .route("/x/v2/reply/main", get(comments))
            .route("/pics/:name", get(picture))
            .with_state((base.clone(), counters.clone()));

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock source");
        });

        Self { base, counters }
    }
}

type SourceState = State<(String, SourceCounters)>;

async fn listing(
    State((_, counters)): SourceState,
    Query(params): Query<HashMap<String, String>>,
) -> Vec<u8> {
    counters.listing_requests.fetch_add(1, Ordering::SeqCst);
    let archives = match params.get("pn").map(String::as_str) {
        Some("1") => vec![
            json!({ "aid": 301, "bvid": "BV301", "cid": 3010 }),
            json!({ "aid": 302, "bvid": "BV302", "cid": 3020 }),
        ],
        _ => Vec::new(),
    };
    serde_json::to_vec(&json!({ "code": 0, "data": { "archives": archives } }))
        .expect("listing json")
}

async fn detail(
    State((base, counters)): SourceState,
    UrlPath(key): UrlPath<String>,
) -> (StatusCode, String) {
    match key.as_str() {
        "BV301" => (StatusCode::OK, detail_page(&base, 301, 71)),
        "BV302" => {
            if counters.flaky_detail_failures.fetch_add(1, Ordering::SeqCst) == 0 {
                (StatusCode::BAD_GATEWAY, String::new())
            } else {
                (StatusCode::OK, detail_page(&base, 302, 72))
            }
        }
        _ => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn comments(Query(params): Query<HashMap<String, String>>) -> Vec<u8> {
    let replies = match params.get("oid").map(String::as_str) {
        Some("301") => vec![json!({ "content": { "message": "first" } })],
        _ => Vec::new(),
    };
    serde_json::to_vec(&json!({ "code": 0, "data": { "replies": replies } }))
        .expect("comments json")
}

async fn picture(UrlPath(_name): UrlPath<String>) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::RgbImage::from_pixel(4, 3, image::Rgb([200, 10, 10]))
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

fn detail_page(base: &str, aid: i64, mid: i64) -> String {
    let state = json!({
        "aid": aid,
        "bvid": format!("BV{aid}"),
        "videoData": {
            "aid": aid,
            "bvid": format!("BV{aid}"),
            "cid": aid * 10,
            "pic": format!("{base}/pics/cover-{aid}.jpg"),
            "desc": "a video",
            "copyright": 1,
            "duration": 61,
            "videos": 1,
            "pubdate": 1_650_000_000,
            "stat": {
                "view": 10, "danmaku": 1, "like": 2, "coin": 3,
                "favorite": 4, "share": 5, "reply": 6
            },
            "owner": { "mid": mid, "name": "up" }
        },
        "upData": {
            "mid": mid.to_string(),
            "name": format!("owner {mid}"),
            "sex": "保密",
            "face": format!("{base}/pics/face-{mid}.png"),
            "sign": "",
            "level_info": { "current_level": 3 },
            "attention": 1,
            "fans": 2
        }
    });
    format!(
        "<html><head><meta name=\"title\" content=\"video {aid}\">\
         <meta name=\"keywords\" content=\"k\"></head><body>\
         <script>window.__INITIAL_STATE__={state};(function(){{}}());</script>\
         </body></html>"
    )
}

async fn run_harvester(source: &MockSource, data_dir: &Path, extra: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bili_harvester"));
    cmd.arg("--category-id")
        .arg(CATEGORY_ID.to_string())
        .arg("--api-url")
        .arg(format!("{}/x/", source.base))
        .arg("--video-url")
        .arg(format!("{}/video/", source.base))
        .arg("--data-dir")
        .arg(data_dir)
        .args([
            "--workers",
            "2",
            "--fetch-attempts",
            "3",
            "--retry-backoff-ms",
            "10",
            "--poll-wait-ms",
            "50",
            "--writer-interval-ms",
            "20",
            "--status-interval-ms",
            "200",
            "--log-level",
            "warn",
        ])
        .args(extra)
        .env_remove("BILI_API_URL")
        .env_remove("BILI_VIDEO_URL")
        .env_remove("BILI_DATA_DIR")
        .env_remove("BILI_PROXY_URL")
        .kill_on_drop(true);

    tokio::time::timeout(Duration::from_secs(60), cmd.output())
        .await
        .expect("harvester finishes in time")
        .expect("harvester runs")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "harvester failed with {:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn harvest_stores_items_owners_pictures_and_comments() {
    let source = MockSource::start().await;
    let data_dir = tempfile::tempdir().expect("tempdir");

    let output = run_harvester(&source, data_dir.path(), &[]).await;
    assert_success(&output);

    let db_path = data_dir.path().join("data.sqlite3");
    let store = SqliteStore::open(&db_path).expect("open store");
    assert_eq!(store.count_items().await.expect("count"), 2);
    assert_eq!(store.read_checkpoint().await.expect("checkpoint"), Some(1));

    for (item_id, owner_id) in [(301, 71), (302, 72)] {
        let item = store
            .load_item(item_id)
            .await
            .expect("load")
            .expect("item row");
        assert_eq!(item.title, format!("video {item_id}"));
        assert!(item.has_local_cover, "cover for {item_id}");
        assert!(data_dir
            .path()
            .join("video_pic")
            .join(format!("{item_id}.jpg"))
            .is_file());

        let owner = store
            .load_owner(owner_id)
            .await
            .expect("load")
            .expect("owner row");
        assert!(owner.has_local_avatar, "avatar for {owner_id}");
        assert!(data_dir
            .path()
            .join("user_face")
            .join(format!("{owner_id}.png"))
            .is_file());
    }

    let comment = store
        .load_comment(301)
        .await
        .expect("load")
        .expect("comment row");
    assert_eq!(comment.messages, r#"["first"]"#);
    let empty = store
        .load_comment(302)
        .await
        .expect("load")
        .expect("comment row");
    assert_eq!(empty.messages, "[]");
    assert!(source.counters.flaky_detail_failures.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_budget_skips_enumeration_on_rerun() {
    let source = MockSource::start().await;
    let data_dir = tempfile::tempdir().expect("tempdir");

    assert_success(&run_harvester(&source, data_dir.path(), &["--item-budget", "2"]).await);
    let listing_after_first_run = source.counters.listing_requests.load(Ordering::SeqCst);
    assert!(listing_after_first_run >= 1);

    assert_success(&run_harvester(&source, data_dir.path(), &["--item-budget", "2"]).await);
    assert_eq!(
        source.counters.listing_requests.load(Ordering::SeqCst),
        listing_after_first_run,
        "a spent budget never reaches the listing API"
    );

    let db_path = data_dir.path().join("data.sqlite3");
    let store = SqliteStore::open(&db_path).expect("open store");
    assert_eq!(store.count_items().await.expect("count"), 2);
}

#[tokio::test]
async fn invalid_flags_exit_with_usage_code() {
    let source = MockSource::start().await;
    let data_dir = tempfile::tempdir().expect("tempdir");

    let output = run_harvester(&source, data_dir.path(), &["--commit-every", "0"]).await;
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--commit-every"));
}
