//! Fetching ranking pages from the two upstream sources.
//!
//! The JSON API is fast and carries tags, but hides sensitive videos. The
//! public HTML page lists everything in the real order. [`hybrid_fetch`]
//! uses the API when it returns a full page and otherwise merges both, with
//! the HTML order winning.

mod nico;
mod parse;

pub use nico::NicoClient;

use crate::{
    ranking::{Genre, Period, RankingItem, Source},
    stats::VideoStats,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub genre: Genre,
    pub period: Period,
    pub tag: Option<String>,
    pub page: u32,
}

impl PageRequest {
    pub fn new(genre: Genre, period: Period, tag: Option<&str>, page: u32) -> Self {
        Self {
            genre,
            period,
            tag: tag.map(str::to_string),
            page: page.max(1),
        }
    }

    fn wants_popular_tags(&self) -> bool {
        self.tag.is_none() && self.page == 1 && self.genre != Genre::All
    }
}

/// One upstream page. Ranks are 1-based within the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub items: Vec<RankingItem>,
    pub popular_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HybridPage {
    pub items: Vec<RankingItem>,
    pub popular_tags: Vec<String>,
    pub source: Source,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("unexpected response from {url}: {message}")]
    Parse { url: String, message: String },
    #[error("api failed ({api}); html failed ({html})")]
    BothFailed {
        api: Box<UpstreamError>,
        html: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Transport failures, throttling and server errors are worth retrying;
    /// other statuses and malformed bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport { .. } => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::Parse { .. } | UpstreamError::BothFailed { .. } => false,
        }
    }
}

/// Blocking access to the video platform. Implementations are called from
/// `spawn_blocking`.
pub trait Upstream: Send + Sync {
    /// One page of the JSON ranking API.
    fn api_page(&self, request: &PageRequest) -> Result<FetchedPage, UpstreamError>;

    /// One page of the public ranking HTML, sensitive items included, with
    /// the page's trend tags.
    fn html_page(&self, request: &PageRequest) -> Result<FetchedPage, UpstreamError>;

    /// Popular tags of a genre. Empty on any failure and for `all`.
    fn popular_tags(&self, genre: Genre) -> Vec<String>;

    /// Current counters per video id. Ids that fail to resolve are absent.
    fn video_stats(&self, ids: &[String]) -> HashMap<String, VideoStats>;
}

pub fn hybrid_fetch(
    upstream: &dyn Upstream,
    request: &PageRequest,
    page_size: usize,
) -> Result<HybridPage, UpstreamError> {
    let api = match upstream.api_page(request) {
        Ok(api) => api,
        Err(api_err) => {
            tracing::warn!(
                genre = %request.genre,
                period = %request.period,
                page = request.page,
                error = %api_err,
                "api page failed; using html only"
            );
            let html = upstream
                .html_page(request)
                .map_err(|html_err| UpstreamError::BothFailed {
                    api: Box::new(api_err),
                    html: Box::new(html_err),
                })?;
            let mut items = dedup_by_id(html.items);
            renumber(&mut items);
            let popular_tags = popular_tags_for(upstream, request, html.popular_tags);
            return Ok(HybridPage {
                items,
                popular_tags,
                source: Source::Html,
            });
        }
    };

    if api.items.len() >= page_size {
        let mut items = dedup_by_id(api.items);
        renumber(&mut items);
        let popular_tags = popular_tags_for(upstream, request, Vec::new());
        return Ok(HybridPage {
            items,
            popular_tags,
            source: Source::Api,
        });
    }

    match upstream.html_page(request) {
        Ok(html) if !html.items.is_empty() => {
            let items = merge_pages(html.items, api.items);
            tracing::debug!(
                genre = %request.genre,
                page = request.page,
                merged = items.len(),
                "merged html and api pages"
            );
            let popular_tags = popular_tags_for(upstream, request, html.popular_tags);
            Ok(HybridPage {
                items,
                popular_tags,
                source: Source::Hybrid,
            })
        }
        Ok(_) => {
            let mut items = dedup_by_id(api.items);
            renumber(&mut items);
            let popular_tags = popular_tags_for(upstream, request, Vec::new());
            Ok(HybridPage {
                items,
                popular_tags,
                source: Source::Api,
            })
        }
        Err(err) => {
            tracing::warn!(genre = %request.genre, page = request.page, error = %err, "html page failed; keeping short api page");
            let mut items = dedup_by_id(api.items);
            renumber(&mut items);
            let popular_tags = popular_tags_for(upstream, request, Vec::new());
            Ok(HybridPage {
                items,
                popular_tags,
                source: Source::Api,
            })
        }
    }
}

fn popular_tags_for(
    upstream: &dyn Upstream,
    request: &PageRequest,
    trend_tags: Vec<String>,
) -> Vec<String> {
    if !request.wants_popular_tags() {
        return Vec::new();
    }
    if !trend_tags.is_empty() {
        return trend_tags;
    }
    upstream.popular_tags(request.genre)
}

/// HTML order and membership win; matching API items fill in what the
/// HTML lacked.
pub fn merge_pages(html: Vec<RankingItem>, api: Vec<RankingItem>) -> Vec<RankingItem> {
    let mut api_by_id: HashMap<String, RankingItem> = HashMap::with_capacity(api.len());
    for item in api {
        api_by_id.entry(item.id.clone()).or_insert(item);
    }

    let mut merged: Vec<RankingItem> = dedup_by_id(html)
        .into_iter()
        .map(|item| match api_by_id.remove(&item.id) {
            Some(api_item) => enrich(item, api_item),
            None => item,
        })
        .collect();
    renumber(&mut merged);
    merged
}

fn enrich(mut html: RankingItem, api: RankingItem) -> RankingItem {
    if !api.tags.is_empty() {
        html.tags = api.tags;
    }
    html.author_name = api.author_name.or(html.author_name);
    html.author_icon = api.author_icon.or(html.author_icon);
    html.author_id = html.author_id.or(api.author_id);
    html.comments = html.comments.or(api.comments);
    html.mylists = html.mylists.or(api.mylists);
    html.likes = html.likes.or(api.likes);
    html.registered_at = html.registered_at.or(api.registered_at);
    if html.views == 0 {
        html.views = api.views;
    }
    if html.thumb_url.is_empty() {
        html.thumb_url = api.thumb_url;
    }
    html
}

pub fn dedup_by_id(items: Vec<RankingItem>) -> Vec<RankingItem> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| !item.id.is_empty() && seen.insert(item.id.clone()))
        .collect()
}

fn renumber(items: &mut [RankingItem]) {
    crate::ranking::rerank(items, 0);
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-process upstream for pipeline and handler tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct FakeUpstream {
        pub api: Mutex<HashMap<(Genre, Period, Option<String>, u32), FetchedPage>>,
        pub html: Mutex<HashMap<(Genre, Period, Option<String>, u32), FetchedPage>>,
        pub tags: Mutex<HashMap<Genre, Vec<String>>>,
        pub stats: Mutex<HashMap<String, VideoStats>>,
        pub fail_all: Mutex<bool>,
        pub calls: Mutex<Vec<String>>,
    }

    fn key(request: &PageRequest) -> (Genre, Period, Option<String>, u32) {
        (
            request.genre,
            request.period,
            request.tag.clone(),
            request.page,
        )
    }

    pub fn item(id: &str) -> RankingItem {
        RankingItem {
            rank: 0,
            id: id.to_string(),
            title: format!("title {id}"),
            thumb_url: format!("https://img.example.invalid/{id}.jpg"),
            views: 100,
            ..RankingItem::default()
        }
    }

    pub fn items(prefix: &str, count: usize) -> Vec<RankingItem> {
        (0..count).map(|i| item(&format!("{prefix}{i}"))).collect()
    }

    impl FakeUpstream {
        pub fn set_api(&self, request: PageRequest, items: Vec<RankingItem>) {
            self.api.lock().insert(
                key(&request),
                FetchedPage {
                    items,
                    popular_tags: Vec::new(),
                },
            );
        }

        pub fn set_html(&self, request: PageRequest, items: Vec<RankingItem>, trend: &[&str]) {
            self.html.lock().insert(
                key(&request),
                FetchedPage {
                    items,
                    popular_tags: trend.iter().map(|t| t.to_string()).collect(),
                },
            );
        }

        pub fn fail(&self, failing: bool) {
            *self.fail_all.lock() = failing;
        }

        pub fn call_count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }

        fn lookup(
            &self,
            kind: &str,
            pages: &Mutex<HashMap<(Genre, Period, Option<String>, u32), FetchedPage>>,
            request: &PageRequest,
        ) -> Result<FetchedPage, UpstreamError> {
            self.calls
                .lock()
                .push(format!("{kind}:{}:{}", request.genre, request.page));
            let url = format!("fake://{kind}/{}/{}", request.genre, request.page);
            if *self.fail_all.lock() {
                return Err(UpstreamError::Status { url, status: 503 });
            }
            pages
                .lock()
                .get(&key(request))
                .cloned()
                .ok_or(UpstreamError::Status { url, status: 404 })
        }
    }

    impl Upstream for FakeUpstream {
        fn api_page(&self, request: &PageRequest) -> Result<FetchedPage, UpstreamError> {
            self.lookup("api", &self.api, request)
        }

        fn html_page(&self, request: &PageRequest) -> Result<FetchedPage, UpstreamError> {
            self.lookup("html", &self.html, request)
        }

        fn popular_tags(&self, genre: Genre) -> Vec<String> {
            self.calls.lock().push(format!("tags:{genre}"));
            self.tags.lock().get(&genre).cloned().unwrap_or_default()
        }

        fn video_stats(&self, ids: &[String]) -> HashMap<String, VideoStats> {
            let stats = self.stats.lock();
            ids.iter()
                .filter_map(|id| stats.get(id).map(|s| (id.clone(), s.clone())))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeUpstream, item, items};
    use super::*;

    fn request(page: u32) -> PageRequest {
        PageRequest::new(Genre::Game, Period::Day, None, page)
    }

    #[test]
    fn full_api_page_is_used_directly() {
        let upstream = FakeUpstream::default();
        upstream.set_api(request(1), items("sm", 100));
        upstream
            .tags
            .lock()
            .insert(Genre::Game, vec!["ゆっくり".into()]);

        let page = hybrid_fetch(&upstream, &request(1), 100).unwrap();
        assert_eq!(page.source, Source::Api);
        assert_eq!(page.items.len(), 100);
        assert_eq!(page.popular_tags, vec!["ゆっくり".to_string()]);
        assert_eq!(upstream.call_count("html"), 0);
    }

    #[test]
    fn short_api_page_is_merged_in_html_order() {
        let upstream = FakeUpstream::default();
        let mut api_a = item("sm1");
        api_a.tags = vec!["tag".into()];
        api_a.author_name = Some("api author".into());
        api_a.likes = Some(5);
        upstream.set_api(request(1), vec![api_a, item("sm2")]);

        let mut html_a = item("sm1");
        html_a.author_name = Some("html author".into());
        let mut sensitive = item("sm9");
        sensitive.require_sensitive_masking = true;
        upstream.set_html(
            request(1),
            vec![sensitive, html_a, item("sm1")],
            &["トレンド"],
        );

        let page = hybrid_fetch(&upstream, &request(1), 100).unwrap();
        assert_eq!(page.source, Source::Hybrid);
        let ids: Vec<_> = page.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["sm9", "sm1"]);
        assert_eq!(page.items[0].rank, 1);
        assert_eq!(page.items[1].rank, 2);
        assert_eq!(page.items[1].tags, vec!["tag".to_string()]);
        assert_eq!(page.items[1].author_name.as_deref(), Some("api author"));
        assert_eq!(page.items[1].likes, Some(5));
        assert!(page.items[0].require_sensitive_masking);
        assert_eq!(page.popular_tags, vec!["トレンド".to_string()]);
    }

    #[test]
    fn api_failure_falls_back_to_html() {
        let upstream = FakeUpstream::default();
        upstream.set_html(request(2), items("so", 3), &[]);
        let page = hybrid_fetch(&upstream, &request(2), 100).unwrap();
        assert_eq!(page.source, Source::Html);
        assert_eq!(page.items.len(), 3);
        assert!(page.popular_tags.is_empty());
    }

    #[test]
    fn html_failure_keeps_short_api_page() {
        let upstream = FakeUpstream::default();
        upstream.set_api(request(1), items("sm", 10));
        let page = hybrid_fetch(&upstream, &request(1), 100).unwrap();
        assert_eq!(page.source, Source::Api);
        assert_eq!(page.items.len(), 10);
    }

    #[test]
    fn both_failing_is_an_error() {
        let upstream = FakeUpstream::default();
        upstream.fail(true);
        let err = hybrid_fetch(&upstream, &request(1), 100).unwrap_err();
        assert!(matches!(err, UpstreamError::BothFailed { .. }));
    }

    #[test]
    fn tag_requests_never_fetch_popular_tags() {
        let upstream = FakeUpstream::default();
        let req = PageRequest::new(Genre::Game, Period::Day, Some("ゆっくり"), 1);
        upstream.set_api(req.clone(), items("sm", 100));
        let page = hybrid_fetch(&upstream, &req, 100).unwrap();
        assert!(page.popular_tags.is_empty());
        assert_eq!(upstream.call_count("tags"), 0);
    }

    #[test]
    fn retryable_errors() {
        let status = |status| UpstreamError::Status {
            url: "u".into(),
            status,
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(
            UpstreamError::Transport {
                url: "u".into(),
                message: "reset".into()
            }
            .is_retryable()
        );
    }
}
