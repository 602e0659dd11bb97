//! Cache warming: rebuilds every genre snapshot and the popular tag
//! rankings, plus a read-only view of what is currently cached.

use crate::{
    pipeline::RankingService,
    ranking::{Genre, Period, RankingSnapshot, snapshot_key},
    tags::sort_by_popularity,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

const TAGS_FROM_EACH_SOURCE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshEntry {
    pub genre: Genre,
    pub period: Period,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub success: bool,
    pub items: usize,
    pub pages_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<RefreshEntry>,
    pub tags_cleaned: usize,
}

impl RefreshReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|entry| entry.success).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }
}

/// Refreshes every genre and period, then the popular tag rankings of each
/// genre's daily ranking. A failing combination is recorded and skipped.
pub async fn refresh_all(service: &RankingService) -> RefreshReport {
    let started_at = Utc::now();
    let mut entries = Vec::new();

    for &genre in Genre::ALL {
        for &period in Period::ALL {
            let popular_tags = match service.refresh_snapshot(genre, period).await {
                Ok(refresh) => {
                    entries.push(RefreshEntry {
                        genre,
                        period,
                        tag: None,
                        success: true,
                        items: refresh.snapshot.items.len(),
                        pages_used: refresh.pages_used,
                        error: None,
                    });
                    refresh.snapshot.popular_tags
                }
                Err(err) => {
                    tracing::warn!(genre = %genre, period = %period, error = %format!("{err:#}"), "snapshot refresh failed");
                    entries.push(failed_entry(genre, period, None, &err));
                    continue;
                }
            };

            if period != Period::Day || genre == Genre::All {
                continue;
            }
            for tag in tags_to_cache(service, genre, &popular_tags).await {
                match service.refresh_tag_page(genre, period, &tag, 1).await {
                    Ok((page, _)) => entries.push(RefreshEntry {
                        genre,
                        period,
                        items: page.items.len(),
                        tag: Some(tag),
                        success: true,
                        pages_used: 1,
                        error: None,
                    }),
                    Err(err) => {
                        tracing::warn!(genre = %genre, tag = %tag, error = %format!("{err:#}"), "tag refresh failed");
                        entries.push(failed_entry(genre, period, Some(tag), &err));
                    }
                }
            }
        }
    }

    let tags_cleaned = match service.tags().cleanup(Utc::now()).await {
        Ok(removed) => removed,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "tag stats cleanup failed");
            0
        }
    };

    let report = RefreshReport {
        started_at,
        finished_at: Utc::now(),
        entries,
        tags_cleaned,
    };
    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        tags_cleaned,
        "refresh finished"
    );
    report
}

fn failed_entry(
    genre: Genre,
    period: Period,
    tag: Option<String>,
    err: &anyhow::Error,
) -> RefreshEntry {
    RefreshEntry {
        genre,
        period,
        tag,
        success: false,
        items: 0,
        pages_used: 0,
        error: Some(format!("{err:#}")),
    }
}

/// Upstream popular tags reordered by local usage, followed by the most
/// requested tags, without duplicates.
async fn tags_to_cache(service: &RankingService, genre: Genre, popular_tags: &[String]) -> Vec<String> {
    let stats = match service.tags().stats().await {
        Ok(stats) => stats,
        Err(err) => {
            tracing::warn!(genre = %genre, error = %format!("{err:#}"), "tag stats unavailable");
            Default::default()
        }
    };
    let by_popularity = sort_by_popularity(popular_tags, stats.get(genre.slug()));
    let by_usage = service
        .tags()
        .popular_by_usage(genre, TAGS_FROM_EACH_SOURCE)
        .await;

    let mut seen = HashSet::new();
    by_popularity
        .into_iter()
        .take(TAGS_FROM_EACH_SOURCE)
        .chain(by_usage)
        .filter(|tag| seen.insert(tag.clone()))
        .take(service.tuning().pipeline.popular_tags_to_cache)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreCacheStatus {
    pub genre: Genre,
    pub cached: bool,
    pub fresh: bool,
    pub items: usize,
    pub popular_tags: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Seconds until the snapshot turns stale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub total: usize,
    pub cached: usize,
    pub fresh: usize,
    pub cached_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatusReport {
    pub backend: &'static str,
    pub genres: Vec<GenreCacheStatus>,
    pub summary: CacheSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

/// Presence and freshness of each genre's daily snapshot.
pub async fn cache_status(service: &RankingService) -> Result<CacheStatusReport> {
    let now = Utc::now();
    let mut genres = Vec::with_capacity(Genre::ALL.len());
    for &genre in Genre::ALL {
        let cached = service
            .kv()
            .get_json::<RankingSnapshot>(&snapshot_key(genre, Period::Day))
            .await?;
        genres.push(match cached {
            Some(cached) => GenreCacheStatus {
                genre,
                cached: true,
                fresh: cached.is_fresh(now),
                items: cached.value.items.len(),
                popular_tags: cached.value.popular_tags.len(),
                updated_at: Some(cached.value.updated_at),
                expires_in: cached.remaining(now).map(|left| left.as_secs()),
            },
            None => GenreCacheStatus {
                genre,
                cached: false,
                fresh: false,
                items: 0,
                popular_tags: 0,
                updated_at: None,
                expires_in: None,
            },
        });
    }

    let total = genres.len();
    let cached = genres.iter().filter(|status| status.cached).count();
    let fresh = genres.iter().filter(|status| status.fresh).count();
    let cached_percent = if total == 0 {
        0.0
    } else {
        (cached as f64 * 1000.0 / total as f64).round() / 10.0
    };
    let last_update = genres.iter().filter_map(|status| status.updated_at).max();

    Ok(CacheStatusReport {
        backend: service.kv().backend_name(),
        genres,
        summary: CacheSummary {
            total,
            cached,
            fresh,
            cached_percent,
        },
        last_update,
    })
}
