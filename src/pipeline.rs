//! Cache lookup, fetch on miss, NG filtering, re-ranking and pagination for
//! the ranking endpoint.

use crate::{
    config::Tuning,
    kv::Kv,
    ng::{NgList, NgStore},
    ranking::{
        Genre, Period, RankingItem, RankingQuery, RankingSnapshot, Source, TagPage, rerank,
        snapshot_key, tag_page_key,
    },
    tags::TagTracker,
    upstream::{HybridPage, PageRequest, Upstream, hybrid_fetch},
};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

/// One served page of a ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingPage {
    pub items: Vec<RankingItem>,
    pub has_more: bool,
    pub total_items: usize,
    /// Only on the first page of a genre ranking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popular_tags: Option<Vec<String>>,
    pub page: u32,
    pub cache_status: CacheStatus,
    /// Seconds the freshly stored entry stays fresh; only on MISS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Result of rebuilding a genre snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRefresh {
    pub snapshot: RankingSnapshot,
    pub pages_used: u32,
    pub ttl: Duration,
}

struct Collected {
    items: Vec<RankingItem>,
    popular_tags: Vec<String>,
    source: Source,
    pages_used: u32,
}

#[derive(Clone)]
pub struct RankingService {
    kv: Kv,
    upstream: Arc<dyn Upstream>,
    ng: NgStore,
    tags: TagTracker,
    tuning: Arc<Tuning>,
}

impl RankingService {
    pub fn new(kv: Kv, upstream: Arc<dyn Upstream>, tuning: Tuning) -> Self {
        let ng = NgStore::new(kv.clone());
        let tags = TagTracker::new(kv.clone(), tuning.ttl.clone());
        Self {
            kv,
            upstream,
            ng,
            tags,
            tuning: Arc::new(tuning),
        }
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    pub fn ng(&self) -> &NgStore {
        &self.ng
    }

    pub fn tags(&self) -> &TagTracker {
        &self.tags
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn upstream(&self) -> Arc<dyn Upstream> {
        self.upstream.clone()
    }

    fn page_size(&self) -> usize {
        self.tuning.pipeline.page_size
    }

    pub async fn ranking(&self, query: &RankingQuery) -> Result<RankingPage> {
        match query.tag.as_deref() {
            Some(tag) => self.tag_ranking(query, tag).await,
            None => self.genre_ranking(query).await,
        }
    }

    async fn genre_ranking(&self, query: &RankingQuery) -> Result<RankingPage> {
        let key = query.cache_key();
        let now = Utc::now();
        let cached = self.read_cache::<RankingSnapshot>(&key).await;

        let (snapshot, cache_status, ttl) = match cached {
            Some(cached) if cached.is_fresh(now) => (cached.value, CacheStatus::Hit, None),
            stale => match self.refresh_snapshot(query.genre, query.period).await {
                Ok(refresh) => (
                    refresh.snapshot,
                    CacheStatus::Miss,
                    Some(refresh.ttl.as_secs()),
                ),
                Err(err) => {
                    let Some(stale) = stale else {
                        return Err(err);
                    };
                    tracing::warn!(key = %key, error = %format!("{err:#}"), "serving stale snapshot");
                    (stale.value, CacheStatus::Stale, None)
                }
            },
        };

        let ng = self.ng.load().await;
        let filtered = ng.filter(snapshot.items, 0);
        self.record_derived(filtered.new_derived_ids);

        let page_size = self.page_size();
        let total_items = filtered.items.len();
        let start = (query.page.saturating_sub(1) as usize).saturating_mul(page_size);
        let end = start.saturating_add(page_size);
        let items: Vec<RankingItem> = filtered
            .items
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect();

        tracing::debug!(
            genre = %query.genre,
            period = %query.period,
            page = query.page,
            cache = cache_status.as_str(),
            total_items,
            "served genre ranking"
        );
        Ok(RankingPage {
            items,
            has_more: end < total_items,
            total_items,
            popular_tags: (query.page == 1).then_some(snapshot.popular_tags),
            page: query.page,
            cache_status,
            ttl,
            updated_at: snapshot.updated_at,
        })
    }

    async fn tag_ranking(&self, query: &RankingQuery, tag: &str) -> Result<RankingPage> {
        self.tags.track(query.genre, tag).await;

        let key = query.cache_key();
        let now = Utc::now();
        let cached = self.read_cache::<TagPage>(&key).await;

        let (page, cache_status, ttl) = match cached {
            Some(cached) if cached.is_fresh(now) => (cached.value, CacheStatus::Hit, None),
            stale => match self
                .refresh_tag_page(query.genre, query.period, tag, query.page)
                .await
            {
                Ok((page, ttl)) => (page, CacheStatus::Miss, Some(ttl.as_secs())),
                Err(err) => {
                    let Some(stale) = stale else {
                        return Err(err);
                    };
                    tracing::warn!(key = %key, error = %format!("{err:#}"), "serving stale tag page");
                    (stale.value, CacheStatus::Stale, None)
                }
            },
        };

        let page_size = self.page_size();
        let has_more = page.items.len() >= page_size;
        let offset = query.page.saturating_sub(1).saturating_mul(page_size as u32);
        let ng = self.ng.load().await;
        let filtered = ng.filter(page.items, offset);
        self.record_derived(filtered.new_derived_ids);

        Ok(RankingPage {
            total_items: offset as usize + filtered.items.len(),
            items: filtered.items,
            has_more,
            popular_tags: None,
            page: query.page,
            cache_status,
            ttl,
            updated_at: page.updated_at,
        })
    }

    async fn read_cache<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Option<crate::kv::Cached<T>> {
        match self.kv.get_json::<T>(key).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(key, error = %format!("{err:#}"), "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Rebuilds and stores the genre snapshot. A failed cache write is
    /// logged; the fresh snapshot is still returned.
    pub async fn refresh_snapshot(&self, genre: Genre, period: Period) -> Result<SnapshotRefresh> {
        let ng = self.ng.load().await;
        let collected = self.collect_snapshot(genre, period, &ng).await?;
        let snapshot = RankingSnapshot {
            items: collected.items,
            popular_tags: collected.popular_tags,
            updated_at: Utc::now(),
            source: collected.source,
        };
        let ttl = self.tags.cache_ttl(genre, None).await;
        let key = snapshot_key(genre, period);
        if let Err(err) = self.kv.put_json(&key, &snapshot, Some(ttl)).await {
            tracing::warn!(key = %key, error = %format!("{err:#}"), "snapshot not cached");
        }
        tracing::info!(
            genre = %genre,
            period = %period,
            items = snapshot.items.len(),
            pages = collected.pages_used,
            "snapshot refreshed"
        );
        Ok(SnapshotRefresh {
            snapshot,
            pages_used: collected.pages_used,
            ttl,
        })
    }

    async fn collect_snapshot(&self, genre: Genre, period: Period, ng: &NgList) -> Result<Collected> {
        let target = self.tuning.pipeline.snapshot_target;
        let max_pages = self.tuning.pipeline.max_snapshot_pages.max(1);
        self.collect(genre, period, None, 1, max_pages, target, ng)
            .await
    }

    /// Builds and stores one page of a tag ranking, returning it with the
    /// TTL it was stored under.
    pub async fn refresh_tag_page(
        &self,
        genre: Genre,
        period: Period,
        tag: &str,
        page: u32,
    ) -> Result<(TagPage, Duration)> {
        let page = page.max(1);
        let page_size = self.page_size();
        let ng = self.ng.load().await;
        let pages = self.tuning.pipeline.tag_fetch_pages.max(1);
        let mut collected = self
            .collect(genre, period, Some(tag), page, pages, page_size, &ng)
            .await?;
        rerank(
            &mut collected.items,
            (page - 1).saturating_mul(page_size as u32),
        );

        let tag_page = TagPage {
            items: collected.items,
            page,
            updated_at: Utc::now(),
            source: collected.source,
        };
        let ttl = self.tags.cache_ttl(genre, Some(tag)).await;
        let key = tag_page_key(genre, period, tag, page);
        if let Err(err) = self.kv.put_json(&key, &tag_page, Some(ttl)).await {
            tracing::warn!(key = %key, error = %format!("{err:#}"), "tag page not cached");
        }
        Ok((tag_page, ttl))
    }

    /// Walks upstream pages from `first_page` until `target` filtered,
    /// distinct items are collected, a page comes back empty, or
    /// `max_pages` were fetched. Only a failure of the first page is an
    /// error.
    #[allow(clippy::too_many_arguments)]
    async fn collect(
        &self,
        genre: Genre,
        period: Period,
        tag: Option<&str>,
        first_page: u32,
        max_pages: u32,
        target: usize,
        ng: &NgList,
    ) -> Result<Collected> {
        let mut items: Vec<RankingItem> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut popular_tags = Vec::new();
        let mut sources: Vec<Source> = Vec::new();
        let mut derived: Vec<String> = Vec::new();
        let mut pages_used = 0;

        for page in first_page..first_page.saturating_add(max_pages) {
            let request = PageRequest::new(genre, period, tag, page);
            let fetched = match self.fetch_page(request).await {
                Ok(fetched) => fetched,
                Err(err) if page == first_page => return Err(err),
                Err(err) => {
                    tracing::warn!(genre = %genre, page, error = %format!("{err:#}"), "stopping early");
                    break;
                }
            };
            pages_used += 1;
            if page == first_page {
                popular_tags = fetched.popular_tags;
            }
            if fetched.items.is_empty() {
                // a genre ranking is never empty; keep the previous snapshot
                if page == first_page && tag.is_none() {
                    bail!("{genre} {period} ranking came back empty");
                }
                break;
            }
            sources.push(fetched.source);

            let filtered = ng.filter(fetched.items, 0);
            derived.extend(filtered.new_derived_ids);
            items.extend(
                filtered
                    .items
                    .into_iter()
                    .filter(|item| seen.insert(item.id.clone())),
            );
            if items.len() >= target {
                break;
            }
        }

        items.truncate(target);
        rerank(&mut items, 0);
        self.record_derived(derived);
        Ok(Collected {
            items,
            popular_tags,
            source: combined_source(&sources),
            pages_used,
        })
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<HybridPage> {
        let upstream = self.upstream.clone();
        let page_size = self.page_size();
        let label = format!("{} {} page {}", request.genre, request.period, request.page);
        tokio::task::spawn_blocking(move || hybrid_fetch(upstream.as_ref(), &request, page_size))
            .await
            .context("upstream task panicked")?
            .with_context(|| format!("fetching {label}"))
    }

    /// Appends newly derived NG ids in the background.
    fn record_derived(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let ng = self.ng.clone();
        tokio::spawn(async move {
            if let Err(err) = ng.add_derived(&ids).await {
                tracing::warn!(error = %format!("{err:#}"), "derived ng ids not saved");
            }
        });
    }
}

fn combined_source(sources: &[Source]) -> Source {
    match sources.first() {
        Some(first) if sources.iter().all(|source| source == first) => *first,
        Some(_) => Source::Hybrid,
        None => Source::Api,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ng::ManualNgList,
        upstream::fake::{FakeUpstream, items},
    };

    fn service(upstream: Arc<FakeUpstream>) -> RankingService {
        RankingService::new(
            Kv::memory(Duration::from_secs(3600)),
            upstream,
            Tuning::default(),
        )
    }

    fn query(tag: Option<&str>, page: u32) -> RankingQuery {
        RankingQuery {
            genre: Genre::Game,
            period: Period::Day,
            tag: tag.map(str::to_string),
            page,
        }
    }

    fn genre_pages(upstream: &FakeUpstream, pages: u32, per_page: usize) {
        for page in 1..=pages {
            upstream.set_api(
                PageRequest::new(Genre::Game, Period::Day, None, page),
                items(&format!("sm{page}0"), per_page),
            );
        }
    }

    async fn wait_for_derived(service: &RankingService, expected: usize) -> Vec<String> {
        for _ in 0..50 {
            tokio::task::yield_now().await;
            let list = service.ng.load().await;
            if list.derived_video_ids.len() >= expected {
                return list.derived_video_ids.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.ng.load().await.derived_video_ids.clone()
    }

    #[tokio::test]
    async fn genre_miss_collects_snapshot_then_hits_cache() {
        let upstream = Arc::new(FakeUpstream::default());
        genre_pages(&upstream, 5, 100);
        upstream
            .tags
            .lock()
            .insert(Genre::Game, vec!["RTA".into()]);
        let service = service(upstream.clone());

        let first = service.ranking(&query(None, 1)).await.unwrap();
        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(first.ttl, Some(3600));
        assert_eq!(first.items.len(), 100);
        assert_eq!(first.total_items, 300);
        assert!(first.has_more);
        assert_eq!(first.popular_tags, Some(vec!["RTA".to_string()]));
        assert_eq!(upstream.call_count("api"), 3);

        let third = service.ranking(&query(None, 3)).await.unwrap();
        assert_eq!(third.cache_status, CacheStatus::Hit);
        assert_eq!(third.items.len(), 100);
        assert_eq!(third.items[0].rank, 201);
        assert!(!third.has_more);
        assert_eq!(third.popular_tags, None);
        assert_eq!(upstream.call_count("api"), 3);

        let beyond = service.ranking(&query(None, 4)).await.unwrap();
        assert!(beyond.items.is_empty());
        assert!(!beyond.has_more);
    }

    #[tokio::test]
    async fn snapshot_dedups_across_pages_and_stops_on_empty_page() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.set_api(
            PageRequest::new(Genre::Game, Period::Day, None, 1),
            items("sm", 100),
        );
        let mut second = items("sm", 50);
        second.extend(items("so", 50));
        upstream.set_api(PageRequest::new(Genre::Game, Period::Day, None, 2), second);
        upstream.set_api(PageRequest::new(Genre::Game, Period::Day, None, 3), Vec::new());
        upstream.set_html(PageRequest::new(Genre::Game, Period::Day, None, 3), Vec::new(), &[]);

        let service = service(upstream.clone());
        let refresh = service
            .refresh_snapshot(Genre::Game, Period::Day)
            .await
            .unwrap();
        assert_eq!(refresh.snapshot.items.len(), 150);
        assert_eq!(refresh.pages_used, 3);
        let ids: HashSet<_> = refresh.snapshot.items.iter().map(|i| &i.id).collect();
        assert_eq!(ids.len(), 150);
        assert_eq!(refresh.snapshot.items[149].rank, 150);
        assert_eq!(upstream.call_count("api:game:4"), 0);
    }

    #[tokio::test]
    async fn ng_edits_apply_to_cached_snapshots() {
        let upstream = Arc::new(FakeUpstream::default());
        genre_pages(&upstream, 3, 100);
        let service = service(upstream);
        service.ranking(&query(None, 1)).await.unwrap();

        service
            .ng
            .save_manual(&ManualNgList {
                video_ids: vec!["sm100".into()],
                video_titles: crate::ng::TextRules {
                    exact: vec!["title sm101".into()],
                    partial: Vec::new(),
                },
                ..ManualNgList::default()
            })
            .await
            .unwrap();

        let page = service.ranking(&query(None, 1)).await.unwrap();
        assert_eq!(page.cache_status, CacheStatus::Hit);
        assert_eq!(page.total_items, 298);
        assert_eq!(page.items[0].id, "sm102");
        assert_eq!(page.items[0].rank, 1);
        assert_eq!(wait_for_derived(&service, 1).await, vec!["sm101"]);
    }

    #[tokio::test]
    async fn stale_snapshot_is_served_when_upstream_fails() {
        let upstream = Arc::new(FakeUpstream::default());
        let service = service(upstream.clone());
        let stale = RankingSnapshot {
            items: items("sm", 5),
            popular_tags: vec![],
            updated_at: Utc::now(),
            source: Source::Api,
        };
        service
            .kv
            .put_json(
                &snapshot_key(Genre::Game, Period::Day),
                &stale,
                Some(Duration::ZERO),
            )
            .await
            .unwrap();
        upstream.fail(true);

        let page = service.ranking(&query(None, 1)).await.unwrap();
        assert_eq!(page.cache_status, CacheStatus::Stale);
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.items[4].rank, 5);
    }

    #[tokio::test]
    async fn stale_tag_page_is_served_when_upstream_fails() {
        let upstream = Arc::new(FakeUpstream::default());
        let service = service(upstream.clone());
        let stale = TagPage {
            items: items("so", 7),
            page: 1,
            updated_at: Utc::now(),
            source: Source::Html,
        };
        service
            .kv
            .put_json(
                &tag_page_key(Genre::Game, Period::Day, "RTA", 1),
                &stale,
                Some(Duration::ZERO),
            )
            .await
            .unwrap();
        upstream.fail(true);

        let page = service.ranking(&query(Some("RTA"), 1)).await.unwrap();
        assert_eq!(page.cache_status, CacheStatus::Stale);
        assert_eq!(page.ttl, None);
        assert_eq!(page.items.len(), 7);
        assert!(!page.has_more);
        assert_eq!(upstream.call_count("api:game:1"), 1);
    }

    #[tokio::test]
    async fn empty_genre_ranking_keeps_previous_snapshot() {
        let upstream = Arc::new(FakeUpstream::default());
        let service = service(upstream.clone());
        let previous = RankingSnapshot {
            items: items("sm", 5),
            popular_tags: vec![],
            updated_at: Utc::now(),
            source: Source::Api,
        };
        let key = snapshot_key(Genre::Game, Period::Day);
        service
            .kv
            .put_json(&key, &previous, Some(Duration::ZERO))
            .await
            .unwrap();
        // api answers with no items and the html page is missing
        upstream.set_api(PageRequest::new(Genre::Game, Period::Day, None, 1), Vec::new());

        let page = service.ranking(&query(None, 1)).await.unwrap();
        assert_eq!(page.cache_status, CacheStatus::Stale);
        assert_eq!(page.items.len(), 5);
        assert!(
            service
                .refresh_snapshot(Genre::Game, Period::Day)
                .await
                .is_err()
        );
        let kept = service
            .kv
            .get_json::<RankingSnapshot>(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.value.items.len(), 5);
    }

    #[tokio::test]
    async fn upstream_failure_without_cache_is_an_error() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.fail(true);
        let service = service(upstream);
        assert!(service.ranking(&query(None, 1)).await.is_err());
        assert!(service.ranking(&query(Some("RTA"), 1)).await.is_err());
    }

    #[tokio::test]
    async fn tag_page_fills_up_across_upstream_pages() {
        let upstream = Arc::new(FakeUpstream::default());
        for page in 2..=4 {
            upstream.set_api(
                PageRequest::new(Genre::Game, Period::Day, Some("RTA"), page),
                items(&format!("sm{page}0"), 100),
            );
        }
        let service = service(upstream.clone());
        service
            .ng
            .save_manual(&ManualNgList {
                author_names: crate::ng::TextRules {
                    exact: Vec::new(),
                    partial: vec!["never".into()],
                },
                video_ids: (0..60).map(|i| format!("sm20{i}")).collect(),
                ..ManualNgList::default()
            })
            .await
            .unwrap();

        let page = service.ranking(&query(Some("RTA"), 2)).await.unwrap();
        assert_eq!(page.cache_status, CacheStatus::Miss);
        assert_eq!(page.ttl, Some(3600));
        assert_eq!(page.items.len(), 100);
        assert_eq!(page.items[0].id, "sm2060");
        assert_eq!(page.items[0].rank, 101);
        assert_eq!(page.items[99].rank, 200);
        assert!(page.has_more);
        assert_eq!(page.popular_tags, None);
        assert_eq!(upstream.call_count("api:game:2"), 1);
        assert_eq!(upstream.call_count("api:game:3"), 1);
        assert_eq!(upstream.call_count("api:game:4"), 0);

        let again = service.ranking(&query(Some("RTA"), 2)).await.unwrap();
        assert_eq!(again.cache_status, CacheStatus::Hit);
        assert_eq!(again.items, page.items);
        assert_eq!(
            service.tags.popular_by_usage(Genre::Game, 10).await,
            vec!["RTA".to_string()]
        );
    }

    #[tokio::test]
    async fn short_tag_ranking_has_no_more_pages() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.set_api(
            PageRequest::new(Genre::Game, Period::Day, Some("レア"), 1),
            items("sm", 12),
        );
        upstream.set_html(
            PageRequest::new(Genre::Game, Period::Day, Some("レア"), 1),
            items("sm", 12),
            &[],
        );
        let service = service(upstream.clone());
        let page = service.ranking(&query(Some("レア"), 1)).await.unwrap();
        assert_eq!(page.items.len(), 12);
        assert!(!page.has_more);
        assert_eq!(page.total_items, 12);
        // upstream page 2 was never configured, so the walk stopped there
        assert_eq!(upstream.call_count("api:game:2"), 1);
    }

    #[test]
    fn combined_source_prefers_hybrid_on_mix() {
        assert_eq!(combined_source(&[Source::Api, Source::Api]), Source::Api);
        assert_eq!(combined_source(&[Source::Api, Source::Html]), Source::Hybrid);
        assert_eq!(combined_source(&[]), Source::Api);
    }
}
