use super::{FetchedPage, PageRequest, Upstream, UpstreamError, parse};
use crate::{config::UpstreamTuning, ranking::Genre, stats::VideoStats, throttle::SlidingWindow};
use std::{collections::HashMap, thread, time::Duration};
use url::Url;

const NVAPI_BASE: &str = "https://nvapi.nicovideo.jp/v1";
const WWW_BASE: &str = "https://www.nicovideo.jp";
const SNAPSHOT_SEARCH_URL: &str =
    "https://snapshot.search.nicovideo.jp/api/v2/snapshot/video/contents/search";

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
/// The public ranking page serves the full list to crawlers.
const CRAWLER_UA: &str = "Googlebot/2.1 (+http://www.google.com/bot.html)";

const INITIAL_BACKOFF: Duration = Duration::from_millis(300);
const MAX_BACKOFF: Duration = Duration::from_millis(1500);
const STATS_BATCH: usize = 10;
const STATS_BATCH_PAUSE: Duration = Duration::from_millis(100);
const THROTTLE_KEY: &str = "nicovideo";

/// Base URLs of the three upstream services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub nvapi: String,
    pub www: String,
    pub snapshot_search: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            nvapi: NVAPI_BASE.to_string(),
            www: WWW_BASE.to_string(),
            snapshot_search: SNAPSHOT_SEARCH_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// Every service rooted at one host, e.g. a local mirror.
    pub fn rooted_at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            nvapi: format!("{base}/v1"),
            www: base.to_string(),
            snapshot_search: format!("{base}/api/v2/snapshot/video/contents/search"),
        }
    }
}

/// Blocking client for the nicovideo endpoints. Every request goes through
/// one shared sliding-window limiter.
pub struct NicoClient {
    agent: ureq::Agent,
    throttle: SlidingWindow,
    retries: u32,
    endpoints: Endpoints,
}

impl NicoClient {
    pub fn new(tuning: &UpstreamTuning) -> Self {
        Self::with_endpoints(tuning, Endpoints::default())
    }

    pub fn with_endpoints(tuning: &UpstreamTuning, endpoints: Endpoints) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(tuning.timeout_secs.max(1)))
            .build();
        Self {
            agent,
            throttle: SlidingWindow::per_minute(tuning.requests_per_minute),
            retries: tuning.retries.max(1),
            endpoints,
        }
    }

    fn get_text(&self, url: &Url, headers: &[(&str, &str)]) -> Result<String, UpstreamError> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            self.throttle.acquire_blocking(THROTTLE_KEY);
            match self.send(url, headers) {
                Ok(body) => return Ok(body),
                Err(err) if attempt < self.retries && err.is_retryable() => {
                    tracing::warn!(url = %url, attempt, error = %err, "retrying upstream request");
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn send(&self, url: &Url, headers: &[(&str, &str)]) -> Result<String, UpstreamError> {
        let mut request = self.agent.get(url.as_str());
        for (name, value) in headers {
            request = request.set(name, value);
        }
        match request.call() {
            Ok(response) => response
                .into_string()
                .map_err(|err| UpstreamError::Transport {
                    url: url.to_string(),
                    message: format!("reading body: {err}"),
                }),
            Err(ureq::Error::Status(status, _)) => Err(UpstreamError::Status {
                url: url.to_string(),
                status,
            }),
            Err(ureq::Error::Transport(transport)) => Err(UpstreamError::Transport {
                url: url.to_string(),
                message: transport.to_string(),
            }),
        }
    }

    fn parse_error(url: &Url, message: String) -> UpstreamError {
        UpstreamError::Parse {
            url: url.to_string(),
            message,
        }
    }
}

fn ranking_params(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![("term", request.period.as_str().to_string())];
    if let Some(tag) = &request.tag {
        params.push(("tag", tag.clone()));
    }
    if request.page > 1 {
        params.push(("page", request.page.to_string()));
    }
    params
}

fn build_url(base: &str, params: &[(&str, String)]) -> Result<Url, UpstreamError> {
    Url::parse_with_params(base, params.iter().map(|(k, v)| (*k, v.as_str()))).map_err(|err| {
        UpstreamError::Parse {
            url: base.to_string(),
            message: format!("invalid url: {err}"),
        }
    })
}

pub(crate) fn api_ranking_url(nvapi: &str, request: &PageRequest) -> Result<Url, UpstreamError> {
    build_url(
        &format!("{nvapi}/ranking/genre/{}", request.genre.upstream_id()),
        &ranking_params(request),
    )
}

pub(crate) fn html_ranking_url(www: &str, request: &PageRequest) -> Result<Url, UpstreamError> {
    build_url(
        &format!("{www}/ranking/genre/{}", request.genre.upstream_id()),
        &ranking_params(request),
    )
}

fn snapshot_url(search: &str, id: &str) -> Result<Url, UpstreamError> {
    build_url(
        search,
        &[
            ("q", id.to_string()),
            ("targets", "title,description".to_string()),
            (
                "fields",
                "contentId,viewCounter,commentCounter,mylistCounter,likeCounter,tags".to_string(),
            ),
            ("_limit", "10".to_string()),
        ],
    )
}

const API_HEADERS: &[(&str, &str)] = &[
    ("User-Agent", BROWSER_UA),
    ("Accept", "application/json"),
    ("X-Frontend-Id", "6"),
    ("X-Frontend-Version", "0"),
    ("Referer", "https://www.nicovideo.jp/"),
];

const HTML_HEADERS: &[(&str, &str)] = &[
    ("User-Agent", CRAWLER_UA),
    ("Accept", "text/html,application/xhtml+xml"),
    ("Accept-Language", "ja,en;q=0.9"),
    ("Cookie", "sensitive_material_status=accept"),
];

impl Upstream for NicoClient {
    fn api_page(&self, request: &PageRequest) -> Result<FetchedPage, UpstreamError> {
        let url = api_ranking_url(&self.endpoints.nvapi, request)?;
        let body = self.get_text(&url, API_HEADERS)?;
        let items = parse::api_ranking(&body).map_err(|msg| Self::parse_error(&url, msg))?;
        Ok(FetchedPage {
            items,
            popular_tags: Vec::new(),
        })
    }

    fn html_page(&self, request: &PageRequest) -> Result<FetchedPage, UpstreamError> {
        let url = html_ranking_url(&self.endpoints.www, request)?;
        let body = self.get_text(&url, HTML_HEADERS)?;
        let parsed = parse::html_ranking(&body).map_err(|msg| Self::parse_error(&url, msg))?;
        Ok(FetchedPage {
            items: parsed.items,
            popular_tags: parsed.trend_tags,
        })
    }

    fn popular_tags(&self, genre: Genre) -> Vec<String> {
        if genre == Genre::All {
            return Vec::new();
        }
        let result = build_url(
            &format!("{}/genres/{}/popular-tags", self.endpoints.nvapi, genre.upstream_id()),
            &[],
        )
        .and_then(|url| {
            let body = self.get_text(&url, API_HEADERS)?;
            parse::api_popular_tags(&body).map_err(|msg| Self::parse_error(&url, msg))
        });
        match result {
            Ok(tags) => tags,
            Err(err) => {
                tracing::warn!(genre = %genre, error = %err, "popular tags unavailable");
                Vec::new()
            }
        }
    }

    fn video_stats(&self, ids: &[String]) -> HashMap<String, VideoStats> {
        let mut stats = HashMap::with_capacity(ids.len());
        for (index, batch) in ids.chunks(STATS_BATCH).enumerate() {
            if index > 0 {
                thread::sleep(STATS_BATCH_PAUSE);
            }
            for id in batch {
                let result = snapshot_url(&self.endpoints.snapshot_search, id).and_then(|url| {
                    let body = self.get_text(&url, &[("User-Agent", CRAWLER_UA)])?;
                    parse::snapshot_stats(&body, id).map_err(|msg| Self::parse_error(&url, msg))
                });
                match result {
                    Ok(Some(found)) => {
                        stats.insert(id.clone(), found);
                    }
                    Ok(None) => tracing::debug!(id = %id, "no snapshot hit"),
                    Err(err) => tracing::debug!(id = %id, error = %err, "stats lookup failed"),
                }
            }
        }
        stats
    }
}
