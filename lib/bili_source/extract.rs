use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::db::{ItemRecord, OwnerRecord};
use crate::pipeline::types::{CommentPage, DetailOutcome, ListingEntry};

const INITIAL_STATE_PATTERN: &str = r"<script>window.__INITIAL_STATE__=(\{.*\});";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to compile extractor pattern: {0}")]
    Pattern(String),

    #[error("detail page has no initial state block")]
    MissingStateBlock,

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("detail page has no <meta name=\"{0}\"> content")]
    MissingMeta(&'static str),

    #[error("initial state has no `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
struct ListingEnvelope {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    archives: Vec<ListingArchive>,
}

#[derive(Debug, Deserialize)]
struct ListingArchive {
    #[serde(deserialize_with = "flexible_i64")]
    aid: i64,
    bvid: String,
    #[serde(deserialize_with = "flexible_i64")]
    cid: i64,
}

/// Parses one listing page. An empty `archives` array is a valid, final page.
pub fn parse_listing(body: &[u8]) -> Result<Vec<ListingEntry>, ExtractError> {
    let envelope: ListingEnvelope = serde_json::from_slice(body)?;
    Ok(envelope
        .data
        .archives
        .into_iter()
        .map(|archive| ListingEntry {
            item_id: archive.aid,
            item_key: archive.bvid,
            content_id: archive.cid,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct VideoData {
    #[serde(deserialize_with = "flexible_i64")]
    aid: i64,
    bvid: String,
    #[serde(deserialize_with = "flexible_i64")]
    cid: i64,
    pic: String,
    #[serde(default)]
    desc: String,
    #[serde(deserialize_with = "flexible_i64")]
    copyright: i64,
    #[serde(deserialize_with = "flexible_i64")]
    duration: i64,
    #[serde(deserialize_with = "flexible_i64")]
    videos: i64,
    #[serde(deserialize_with = "flexible_i64")]
    pubdate: i64,
    stat: VideoStat,
    owner: VideoOwner,
}

#[derive(Debug, Deserialize)]
struct VideoStat {
    #[serde(deserialize_with = "flexible_i64")]
    view: i64,
    #[serde(deserialize_with = "flexible_i64")]
    danmaku: i64,
    #[serde(deserialize_with = "flexible_i64")]
    like: i64,
    #[serde(deserialize_with = "flexible_i64")]
    coin: i64,
    #[serde(deserialize_with = "flexible_i64")]
    favorite: i64,
    #[serde(deserialize_with = "flexible_i64")]
    share: i64,
    #[serde(deserialize_with = "flexible_i64")]
    reply: i64,
}

#[derive(Debug, Deserialize)]
struct VideoOwner {
    #[serde(deserialize_with = "flexible_i64")]
    mid: i64,
}

#[derive(Debug, Deserialize)]
struct UpData {
    #[serde(deserialize_with = "flexible_i64")]
    mid: i64,
    name: String,
    #[serde(default)]
    sex: String,
    face: String,
    #[serde(default)]
    sign: String,
    level_info: LevelInfo,
    #[serde(deserialize_with = "flexible_i64")]
    attention: i64,
    #[serde(deserialize_with = "flexible_i64")]
    fans: i64,
}

#[derive(Debug, Deserialize)]
struct LevelInfo {
    #[serde(deserialize_with = "flexible_i64")]
    current_level: i64,
}

/// The source is inconsistent about quoting numeric ids.
fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(value) => Ok(value),
        IntOrString::Str(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Compiled patterns for detail pages. Built once per source and shared by every worker.
#[derive(Debug, Clone)]
pub struct DetailExtractor {
    state_block: Regex,
    title: Selector,
    keywords: Selector,
}

impl DetailExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        let state_block = Regex::new(INITIAL_STATE_PATTERN)
            .map_err(|err| ExtractError::Pattern(err.to_string()))?;
        let title = Selector::parse(r#"meta[name="title"]"#)
            .map_err(|err| ExtractError::Pattern(format!("{err:?}")))?;
        let keywords = Selector::parse(r#"meta[name="keywords"]"#)
            .map_err(|err| ExtractError::Pattern(format!("{err:?}")))?;
        Ok(Self {
            state_block,
            title,
            keywords,
        })
    }

    /// Builds item and owner records from a detail page.
    ///
    /// A `videoData.stat` that is null or an empty object means the source deleted the item.
    /// A state block without `videoData` or `videoData.stat` is malformed.
    pub fn parse_detail(
        &self,
        html: &str,
        ingest_time: i64,
    ) -> Result<DetailOutcome, ExtractError> {
        let block = self
            .state_block
            .captures(html)
            .and_then(|captures| captures.get(1))
            .ok_or(ExtractError::MissingStateBlock)?;
        let state: Value = serde_json::from_str(block.as_str())?;

        let video_data = state
            .get("videoData")
            .ok_or(ExtractError::MissingField("videoData"))?;
        let stat = video_data
            .get("stat")
            .ok_or(ExtractError::MissingField("videoData.stat"))?;
        if is_deleted_stat(stat) {
            return Ok(DetailOutcome::Deleted);
        }

        let video: VideoData = serde_json::from_value(video_data.clone())?;
        let up: UpData =
            serde_json::from_value(state.get("upData").cloned().unwrap_or(Value::Null))?;

        let document = Html::parse_document(html);
        let title = meta_content(&document, &self.title).ok_or(ExtractError::MissingMeta("title"))?;
        let keywords =
            meta_content(&document, &self.keywords).ok_or(ExtractError::MissingMeta("keywords"))?;

        let item = ItemRecord {
            item_id: video.aid,
            item_key: video.bvid,
            content_id: video.cid,
            cover_ref: video.pic,
            title,
            description: video.desc,
            keywords,
            flags: video.copyright,
            duration: video.duration,
            part_count: video.videos,
            publish_time: video.pubdate,
            view_count: video.stat.view,
            comment_count: video.stat.danmaku,
            like_count: video.stat.like,
            coin_count: video.stat.coin,
            favorite_count: video.stat.favorite,
            share_count: video.stat.share,
            reply_count: video.stat.reply,
            owner_id: video.owner.mid,
            has_local_cover: false,
            ingest_time,
        };

        let owner = OwnerRecord {
            owner_id: up.mid,
            name: up.name,
            sex: up.sex,
            avatar_ref: up.face,
            bio: up.sign,
            level: up.level_info.current_level,
            following_count: up.attention,
            fan_count: up.fans,
            has_local_avatar: false,
            ingest_time,
        };

        Ok(DetailOutcome::Found { item, owner })
    }
}

fn is_deleted_stat(stat: &Value) -> bool {
    match stat {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|element| element.value().attr("content"))
        .map(str::to_string)
}

/// Extracts reply bodies from a comment API payload.
///
/// Never fails: anything other than a well-formed reply list degrades to an empty list.
pub fn parse_comments(body: &[u8]) -> CommentPage {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => {
            return CommentPage::Degraded {
                reason: format!("comment payload is not JSON: {err}"),
            }
        }
    };

    let replies = match payload.get("data").and_then(|data| data.get("replies")) {
        Some(Value::Array(replies)) => replies,
        Some(Value::Null) => return CommentPage::Replies(Vec::new()),
        Some(_) => {
            return CommentPage::Degraded {
                reason: "data.replies is not an array".to_string(),
            }
        }
        None => {
            return CommentPage::Degraded {
                reason: "payload has no data.replies".to_string(),
            }
        }
    };

    let mut messages = Vec::with_capacity(replies.len());
    for reply in replies {
        match reply
            .get("content")
            .and_then(|content| content.get("message"))
            .and_then(Value::as_str)
        {
            Some(message) => messages.push(message.to_string()),
            None => {
                return CommentPage::Degraded {
                    reason: "reply entry has no content.message".to_string(),
                }
            }
        }
    }
    CommentPage::Replies(messages)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn state_page(state: &str) -> String {
        format!("<html><body><script>window.__INITIAL_STATE__={state};</script></body></html>")
    }

    #[test]
    fn listing_entries_keep_page_order() {
        let body = listing_body(&[(11, "BV11", 110), (12, "BV12", 120)]);
        let entries = parse_listing(&body).expect("listing");
        assert_eq!(
            entries,
            vec![
                ListingEntry {
                    item_id: 11,
                    item_key: "BV11".to_string(),
                    content_id: 110
                },
                ListingEntry {
                    item_id: 12,
                    item_key: "BV12".to_string(),
                    content_id: 120
                },
            ]
        );
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        assert!(parse_listing(&listing_body(&[])).expect("listing").is_empty());
    }

    #[test]
    fn listing_without_archives_is_malformed() {
        assert!(parse_listing(br#"{"code":-404,"data":null}"#).is_err());
    }

    #[test]
    fn detail_page_maps_every_field() {
        let extractor = DetailExtractor::new().expect("extractor");
        let outcome = extractor
            .parse_detail(&detail_page(170001, "BV1xx", 42), 1_700_000_123)
            .expect("detail");

        let DetailOutcome::Found { item, owner } = outcome else {
            panic!("expected a live item");
        };
        assert_eq!(item.item_id, 170001);
        assert_eq!(item.item_key, "BV1xx");
        assert_eq!(item.content_id, 1_700_010);
        assert_eq!(item.title, "title 170001");
        assert_eq!(item.keywords, "kw1,kw2");
        assert_eq!(item.part_count, 2);
        assert_eq!(item.comment_count, 33);
        assert_eq!(item.reply_count, 17);
        assert_eq!(item.owner_id, 42);
        assert!(!item.has_local_cover);
        assert_eq!(item.ingest_time, 1_700_000_123);

        assert_eq!(owner.owner_id, 42);
        assert_eq!(owner.level, 6);
        assert_eq!(owner.following_count, 15);
        assert_eq!(owner.fan_count, 2048);
        assert!(owner.avatar_ref.ends_with("/42.png"));
    }

    #[test]
    fn null_stat_marks_item_deleted() {
        let extractor = DetailExtractor::new().expect("extractor");
        let outcome = extractor
            .parse_detail(&deleted_page(5), 0)
            .expect("deleted page parses");
        assert_eq!(outcome, DetailOutcome::Deleted);
    }

    #[test]
    fn empty_stat_marks_item_deleted() {
        let extractor = DetailExtractor::new().expect("extractor");
        let page = state_page(r#"{"videoData":{"aid":1,"stat":{}}}"#);
        let outcome = extractor.parse_detail(&page, 0).expect("deleted page parses");
        assert_eq!(outcome, DetailOutcome::Deleted);
    }

    #[test]
    fn state_without_video_data_is_malformed() {
        let extractor = DetailExtractor::new().expect("extractor");
        let page = state_page(r#"{"aid":1,"someOtherShape":{}}"#);
        let err = extractor
            .parse_detail(&page, 0)
            .expect_err("unknown state shape");
        assert!(matches!(err, ExtractError::MissingField("videoData")));
    }

    #[test]
    fn video_data_without_stat_is_malformed() {
        let extractor = DetailExtractor::new().expect("extractor");
        let page = state_page(r#"{"videoData":{"aid":1}}"#);
        let err = extractor
            .parse_detail(&page, 0)
            .expect_err("stat is required");
        assert!(matches!(err, ExtractError::MissingField("videoData.stat")));
        assert_eq!(
            crate::bili_source::error_mapping::map_extract_error(err).kind,
            crate::pipeline::types::FetchErrorKind::MalformedResponse
        );
    }

    #[test]
    fn page_without_state_block_is_malformed() {
        let extractor = DetailExtractor::new().expect("extractor");
        let err = extractor
            .parse_detail("<html><body>captcha</body></html>", 0)
            .expect_err("no state block");
        assert!(matches!(err, ExtractError::MissingStateBlock));
    }

    #[test]
    fn comment_messages_are_extracted_in_order() {
        assert_eq!(
            parse_comments(&comments_body(&["first", "第二"])),
            CommentPage::Replies(vec!["first".to_string(), "第二".to_string()])
        );
    }

    #[test]
    fn null_replies_mean_no_comments() {
        assert_eq!(
            parse_comments(br#"{"data":{"replies":null}}"#),
            CommentPage::Replies(Vec::new())
        );
    }

    #[test]
    fn unexpected_comment_shapes_degrade() {
        assert!(matches!(
            parse_comments(b"<html>rate limited</html>"),
            CommentPage::Degraded { .. }
        ));
        assert!(matches!(
            parse_comments(br#"{"data":{"replies":[{"content":{}}]}}"#),
            CommentPage::Degraded { .. }
        ));
    }
}
