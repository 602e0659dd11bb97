use crate::{ranking::RankingItem, stats::VideoStats};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;

pub const MAX_POPULAR_TAGS: usize = 20;

const RANKING_ITEMS_POINTER: &str = "/data/response/$getTeibanRanking/data/items";
const TREND_TAGS_POINTER: &str =
    "/data/response/$getTeibanRankingFeaturedKeyAndTrendTags/data/trendTags";
const ALL_TAGS_LABEL: &str = "すべて";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTag {
    Named { name: String },
    Plain(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawThumbnail {
    large_url: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCount {
    view: Option<u64>,
    comment: Option<u64>,
    mylist: Option<u64>,
    like: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOwner {
    id: Option<RawId>,
    name: Option<String>,
    icon_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVideo {
    id: String,
    #[serde(default)]
    title: String,
    thumbnail: Option<RawThumbnail>,
    count: Option<RawCount>,
    owner: Option<RawOwner>,
    registered_at: Option<String>,
    #[serde(default)]
    require_sensitive_masking: bool,
    #[serde(default)]
    tags: Option<Vec<RawTag>>,
}

impl RawVideo {
    fn into_item(self, rank: u32) -> RankingItem {
        let thumbnail = self.thumbnail.unwrap_or_default();
        let count = self.count.unwrap_or_default();
        let owner = self.owner.unwrap_or_default();
        RankingItem {
            rank,
            id: self.id,
            title: self.title,
            thumb_url: thumbnail.large_url.or(thumbnail.url).unwrap_or_default(),
            views: count.view.unwrap_or(0),
            comments: count.comment,
            mylists: count.mylist,
            likes: count.like,
            tags: self
                .tags
                .unwrap_or_default()
                .into_iter()
                .map(|tag| match tag {
                    RawTag::Named { name } => name,
                    RawTag::Plain(name) => name,
                })
                .filter(|name| !name.trim().is_empty())
                .collect(),
            author_id: owner.id.map(RawId::into_string),
            author_name: owner.name,
            author_icon: owner.icon_url,
            registered_at: self.registered_at,
            require_sensitive_masking: self.require_sensitive_masking,
        }
    }
}

fn into_items(raw: Vec<RawVideo>) -> Vec<RankingItem> {
    raw.into_iter()
        .enumerate()
        .map(|(index, video)| video.into_item(index as u32 + 1))
        .collect()
}

#[derive(Debug, Deserialize)]
struct Meta {
    status: u16,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    meta: Meta,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RankingData {
    items: Vec<RawVideo>,
}

#[derive(Debug, Deserialize)]
struct PopularTagsData {
    #[serde(default)]
    tags: Vec<RawTag>,
}

/// Parses the nvapi ranking envelope. Requires `meta.status == 200` and a
/// `data.items` array.
pub fn api_ranking(body: &str) -> Result<Vec<RankingItem>, String> {
    let envelope: Envelope<RankingData> =
        serde_json::from_str(body).map_err(|err| format!("invalid ranking json: {err}"))?;
    if envelope.meta.status != 200 {
        return Err(format!("meta.status {}", envelope.meta.status));
    }
    let data = envelope.data.ok_or_else(|| "missing data.items".to_string())?;
    Ok(into_items(data.items))
}

pub fn api_popular_tags(body: &str) -> Result<Vec<String>, String> {
    let envelope: Envelope<PopularTagsData> =
        serde_json::from_str(body).map_err(|err| format!("invalid popular-tags json: {err}"))?;
    if envelope.meta.status != 200 {
        return Err(format!("meta.status {}", envelope.meta.status));
    }
    Ok(envelope
        .data
        .map(|data| data.tags)
        .unwrap_or_default()
        .into_iter()
        .map(|tag| match tag {
            RawTag::Named { name } => name,
            RawTag::Plain(name) => name,
        })
        .filter(|tag| !tag.trim().is_empty())
        .take(MAX_POPULAR_TAGS)
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHit {
    content_id: String,
    view_counter: Option<u64>,
    comment_counter: Option<u64>,
    mylist_counter: Option<u64>,
    like_counter: Option<u64>,
    tags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotSearch {
    #[serde(default)]
    data: Vec<SnapshotHit>,
}

/// Picks the hit whose `contentId` is exactly `id` out of a snapshot search
/// response.
pub fn snapshot_stats(body: &str, id: &str) -> Result<Option<VideoStats>, String> {
    let search: SnapshotSearch =
        serde_json::from_str(body).map_err(|err| format!("invalid snapshot json: {err}"))?;
    Ok(search
        .data
        .into_iter()
        .find(|hit| hit.content_id == id)
        .map(|hit| VideoStats {
            view_counter: hit.view_counter.unwrap_or(0),
            comment_counter: hit.comment_counter.unwrap_or(0),
            mylist_counter: hit.mylist_counter.unwrap_or(0),
            like_counter: hit.like_counter.unwrap_or(0),
            tags: hit.tags.map(|tags| {
                tags.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            }),
        }))
}

/// Items and trend tags scraped from a ranking HTML page.
#[derive(Debug, Default, PartialEq)]
pub struct HtmlRanking {
    pub items: Vec<RankingItem>,
    pub trend_tags: Vec<String>,
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|err| format!("parse selector {css}: {err:?}"))
}

/// Reads the embedded `server-response` JSON first and falls back to the
/// rendered markup when it is missing.
pub fn html_ranking(html: &str) -> Result<HtmlRanking, String> {
    let doc = Html::parse_document(html);
    let embedded = server_response(&doc)?;

    let (items, mut trend_tags) = match embedded {
        Some(value) => {
            let items = match value.pointer(RANKING_ITEMS_POINTER) {
                Some(raw) => {
                    let raw: Vec<RawVideo> = serde_json::from_value(raw.clone())
                        .map_err(|err| format!("invalid server-response items: {err}"))?;
                    into_items(raw)
                }
                None => markup_items(&doc)?,
            };
            (items, trend_tags(&value))
        }
        None => (markup_items(&doc)?, Vec::new()),
    };

    if items.is_empty() {
        return Err("no ranking items in page".to_string());
    }
    if trend_tags.is_empty() {
        trend_tags = popular_tag_anchors(&doc)?;
    }
    Ok(HtmlRanking { items, trend_tags })
}

fn server_response(doc: &Html) -> Result<Option<Value>, String> {
    let meta = selector(r#"meta[name="server-response"]"#)?;
    let Some(content) = doc
        .select(&meta)
        .next()
        .and_then(|element| element.value().attr("content"))
    else {
        return Ok(None);
    };
    serde_json::from_str(content)
        .map(Some)
        .map_err(|err| format!("invalid server-response json: {err}"))
}

fn trend_tags(value: &Value) -> Vec<String> {
    let Some(tags) = value.pointer(TREND_TAGS_POINTER).and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for tag in tags.iter().filter_map(Value::as_str).map(str::trim) {
        if !tag.is_empty() && !out.iter().any(|seen| seen == tag) {
            out.push(tag.to_string());
        }
    }
    out.truncate(MAX_POPULAR_TAGS);
    out
}

fn popular_tag_anchors(doc: &Html) -> Result<Vec<String>, String> {
    let anchors = selector(r#"a[class*="PopularTag"], .PopularTag a, .tag-list a"#)?;
    let mut out: Vec<String> = Vec::new();
    for anchor in doc.select(&anchors) {
        let text = element_text(anchor);
        if text.is_empty() || text.contains(ALL_TAGS_LABEL) || out.contains(&text) {
            continue;
        }
        out.push(text);
        if out.len() >= MAX_POPULAR_TAGS {
            break;
        }
    }
    Ok(out)
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last-resort parse of the rendered ranking list.
fn markup_items(doc: &Html) -> Result<Vec<RankingItem>, String> {
    let containers = [
        ".RankingMainVideo",
        ".RankingVideo",
        r#"[class*="RankingVideo"]"#,
        ".ranking-item",
        "li[data-video-id]",
    ];
    let watch_link = selector(r#"a[href*="/watch/"]"#)?;
    let title_sel = selector(r#".VideoTitle, [class*="Title"], h3, h4"#)?;
    let img_sel = selector("img")?;
    let view_sels = [
        selector(".VideoMetaCount--view")?,
        selector(r#"[class*="view"]"#)?,
        selector(".play")?,
    ];

    for container in containers {
        let container = selector(container)?;
        let elements: Vec<ElementRef<'_>> = doc.select(&container).collect();
        if elements.is_empty() {
            continue;
        }

        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            let id = element
                .select(&watch_link)
                .filter_map(|link| link.value().attr("href"))
                .find_map(video_id_from_href)
                .or_else(|| element.value().attr("data-video-id").map(str::to_string));
            let Some(id) = id else {
                continue;
            };

            let img = element.select(&img_sel).next();
            let title = element
                .select(&title_sel)
                .next()
                .map(element_text)
                .filter(|title| !title.is_empty())
                .or_else(|| img.and_then(|img| img.value().attr("alt")).map(str::to_string))
                .unwrap_or_default();
            let thumb_url = img
                .and_then(|img| {
                    let attrs = img.value();
                    attrs
                        .attr("src")
                        .or_else(|| attrs.attr("data-src"))
                        .or_else(|| attrs.attr("data-original"))
                })
                .unwrap_or_default()
                .to_string();
            let views = view_sels
                .iter()
                .filter_map(|sel| element.select(sel).next())
                .find_map(|node| parse_count(&element_text(node)))
                .unwrap_or(0);

            items.push(RankingItem {
                rank: items.len() as u32 + 1,
                id,
                title: strip_rank_prefix(&title).to_string(),
                thumb_url,
                views,
                ..RankingItem::default()
            });
        }
        return Ok(items);
    }
    Ok(Vec::new())
}

/// `/watch/sm123?ref=x` → `sm123`. Only `sm`, `nm` and `so` ids count.
pub fn video_id_from_href(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("watch/")?;
    let prefix = rest.get(..2)?;
    if !matches!(prefix, "sm" | "nm" | "so") {
        return None;
    }
    let digits: String = rest[2..].chars().take_while(char::is_ascii_digit).collect();
    (!digits.is_empty()).then(|| format!("{prefix}{digits}"))
}

fn parse_count(text: &str) -> Option<u64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Drops a leading `第12位：` rank label.
fn strip_rank_prefix(title: &str) -> &str {
    let trimmed = title.trim();
    let Some(rest) = trimmed.strip_prefix('第') else {
        return trimmed;
    };
    let digits_end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(index, _)| index)
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return trimmed;
    }
    let after = &rest[digits_end..];
    for label in ["位：", "位:"] {
        if let Some(title) = after.strip_prefix(label) {
            return title.trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escape_attr(raw: &str) -> String {
        raw.replace('&', "&amp;").replace('"', "&quot;")
    }

    fn page_with_meta(json: &str, extra: &str) -> String {
        format!(
            r#"<html><head><meta name="server-response" content="{}"></head><body>{}</body></html>"#,
            escape_attr(json),
            extra
        )
    }

    #[test]
    fn api_ranking_maps_nested_fields() {
        let body = r#"{
            "meta": {"status": 200},
            "data": {"items": [
                {"id": "sm1", "title": "first",
                 "thumbnail": {"url": "u", "largeUrl": "L"},
                 "count": {"view": 10, "comment": 2, "mylist": 3, "like": 4},
                 "owner": {"id": 42, "name": "owner", "iconUrl": "icon"},
                 "registeredAt": "2024-01-01T00:00:00+09:00",
                 "tags": [{"name": "ゲーム"}, {"name": " "}]},
                {"id": "sm2", "title": "second", "owner": null}
            ]}
        }"#;
        let items = api_ranking(body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[0].thumb_url, "L");
        assert_eq!(items[0].views, 10);
        assert_eq!(items[0].likes, Some(4));
        assert_eq!(items[0].author_id.as_deref(), Some("42"));
        assert_eq!(items[0].tags, vec!["ゲーム".to_string()]);
        assert_eq!(items[1].rank, 2);
        assert_eq!(items[1].author_name, None);
    }

    #[test]
    fn api_ranking_rejects_bad_status_or_missing_items() {
        assert!(api_ranking(r#"{"meta":{"status":400}}"#).is_err());
        assert!(api_ranking(r#"{"meta":{"status":200}}"#).is_err());
        assert!(api_ranking("not json").is_err());
    }

    #[test]
    fn popular_tags_are_capped() {
        let tags: Vec<String> = (0..30).map(|i| format!("\"t{i}\"")).collect();
        let body = format!(
            r#"{{"meta":{{"status":200}},"data":{{"tags":[{}]}}}}"#,
            tags.join(",")
        );
        let parsed = api_popular_tags(&body).unwrap();
        assert_eq!(parsed.len(), MAX_POPULAR_TAGS);
        assert_eq!(parsed[0], "t0");
    }

    #[test]
    fn html_ranking_reads_server_response_meta() {
        let json = r#"{"data":{"response":{
            "$getTeibanRanking":{"data":{"items":[
                {"id":"sm5","title":"A & B","requireSensitiveMasking":true,
                 "count":{"view":7}}
            ]}},
            "$getTeibanRankingFeaturedKeyAndTrendTags":{"data":{"trendTags":["VOICEROID", " ", 3, "VOICEROID", "旅"]}}
        }}}"#;
        let parsed = html_ranking(&page_with_meta(json, "")).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].title, "A & B");
        assert!(parsed.items[0].require_sensitive_masking);
        assert_eq!(parsed.items[0].views, 7);
        assert_eq!(
            parsed.trend_tags,
            vec!["VOICEROID".to_string(), "旅".to_string()]
        );
    }

    #[test]
    fn html_ranking_falls_back_to_popular_tag_anchors() {
        let json = r#"{"data":{"response":{"$getTeibanRanking":{"data":{"items":[{"id":"sm5","title":"x"}]}}}}}"#;
        let anchors = r#"
            <a class="PopularTag-link" href="/t">すべて</a>
            <a class="PopularTag-link" href="/t"> 実況 </a>
            <a class="PopularTag-link" href="/t">実況</a>
            <a class="Other">skip</a>"#;
        let parsed = html_ranking(&page_with_meta(json, anchors)).unwrap();
        assert_eq!(parsed.trend_tags, vec!["実況".to_string()]);
    }

    #[test]
    fn html_ranking_parses_markup_without_meta() {
        let html = r#"<html><body><ul>
            <li class="RankingMainVideo">
              <a href="https://www.nicovideo.jp/watch/sm100?ref=rank"><img src="a.jpg" alt="alt"></a>
              <p class="VideoTitle">第1位：Hello</p>
              <span class="VideoMetaCount--view">1,234</span>
            </li>
            <li class="RankingMainVideo">
              <a href="/watch/lv1">live</a>
            </li>
            <li class="RankingMainVideo" data-video-id="so7">
              <img data-src="b.jpg" alt="From alt">
            </li>
        </ul></body></html>"#;
        let parsed = html_ranking(html).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].id, "sm100");
        assert_eq!(parsed.items[0].title, "Hello");
        assert_eq!(parsed.items[0].views, 1234);
        assert_eq!(parsed.items[0].thumb_url, "a.jpg");
        assert_eq!(parsed.items[1].id, "so7");
        assert_eq!(parsed.items[1].rank, 2);
        assert_eq!(parsed.items[1].title, "From alt");
        assert_eq!(parsed.items[1].thumb_url, "b.jpg");
    }

    #[test]
    fn html_ranking_without_items_is_an_error() {
        assert!(html_ranking("<html><body>maintenance</body></html>").is_err());
    }

    #[test]
    fn snapshot_stats_requires_exact_id() {
        let body = r#"{"data":[
            {"contentId":"sm10","viewCounter":1},
            {"contentId":"sm1","viewCounter":5,"commentCounter":2,"mylistCounter":1,"likeCounter":3,"tags":"a  b"}
        ]}"#;
        let stats = snapshot_stats(body, "sm1").unwrap().unwrap();
        assert_eq!(stats.view_counter, 5);
        assert_eq!(stats.like_counter, 3);
        assert_eq!(stats.tags, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(snapshot_stats(body, "sm2").unwrap().is_none());
    }

    #[test]
    fn video_ids_from_links() {
        assert_eq!(video_id_from_href("/watch/sm9"), Some("sm9".into()));
        assert_eq!(
            video_id_from_href("https://x/watch/nm12?x=1"),
            Some("nm12".into())
        );
        assert_eq!(video_id_from_href("/watch/lv1"), None);
        assert_eq!(video_id_from_href("/watch/sm"), None);
    }

    #[test]
    fn rank_prefix_is_stripped() {
        assert_eq!(strip_rank_prefix("第12位：タイトル"), "タイトル");
        assert_eq!(strip_rank_prefix("第3位:x"), "x");
        assert_eq!(strip_rank_prefix("第一話"), "第一話");
    }
}
