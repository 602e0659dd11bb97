//! Tag usage counters that drive which tag rankings get cached and for how
//! long.

use crate::{config::TtlTuning, kv::Kv, ranking::Genre};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

pub const STATS_KEY: &str = "tag-popularity-stats";
const STATS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const STALE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagUsage {
    pub count: u64,
    pub last_accessed: DateTime<Utc>,
}

/// genre slug → tag → usage
pub type TagStats = BTreeMap<String, BTreeMap<String, TagUsage>>;

#[derive(Clone)]
pub struct TagTracker {
    kv: Kv,
    ttl: TtlTuning,
    writes: Arc<tokio::sync::Mutex<()>>,
}

impl TagTracker {
    pub fn new(kv: Kv, ttl: TtlTuning) -> Self {
        Self {
            kv,
            ttl,
            writes: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn stats(&self) -> Result<TagStats> {
        Ok(self
            .kv
            .get_json::<TagStats>(STATS_KEY)
            .await?
            .filter(|cached| cached.is_fresh(Utc::now()))
            .map(|cached| cached.value)
            .unwrap_or_default())
    }

    /// Counts one access. Failures are logged and swallowed.
    pub async fn track(&self, genre: Genre, tag: &str) {
        if let Err(err) = self.try_track(genre, tag, Utc::now()).await {
            tracing::warn!(genre = %genre, tag, error = %err, "tag usage not recorded");
        }
    }

    async fn try_track(&self, genre: Genre, tag: &str, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.writes.lock().await;
        let mut stats = self.stats().await?;
        let usage = stats
            .entry(genre.slug().to_string())
            .or_default()
            .entry(tag.to_string())
            .or_insert(TagUsage {
                count: 0,
                last_accessed: now,
            });
        usage.count += 1;
        usage.last_accessed = now;
        self.kv.put_json(STATS_KEY, &stats, Some(STATS_TTL)).await
    }

    /// Most used tags of `genre`, highest count first.
    pub async fn popular_by_usage(&self, genre: Genre, limit: usize) -> Vec<String> {
        match self.stats().await {
            Ok(stats) => usage_order(stats.get(genre.slug()), limit),
            Err(err) => {
                tracing::warn!(genre = %genre, error = %err, "tag stats unavailable");
                Vec::new()
            }
        }
    }

    /// Genre rankings use the genre TTL; tag rankings live longer the more
    /// they are requested.
    pub async fn cache_ttl(&self, genre: Genre, tag: Option<&str>) -> Duration {
        let Some(tag) = tag else {
            return Duration::from_secs(self.ttl.genre_secs);
        };
        let popular = self.popular_by_usage(genre, 20).await;
        ttl_for_rank(&self.ttl, popular.iter().position(|t| t == tag))
    }

    /// Drops tags idle for more than 30 days and genres left empty. Returns
    /// the number of tags removed.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.writes.lock().await;
        let mut stats = self.stats().await?;
        let removed = prune(&mut stats, now);
        if removed > 0 {
            self.kv.put_json(STATS_KEY, &stats, Some(STATS_TTL)).await?;
            tracing::info!(removed, "dropped idle tag stats");
        }
        Ok(removed)
    }
}

fn usage_order(genre_stats: Option<&BTreeMap<String, TagUsage>>, limit: usize) -> Vec<String> {
    let Some(genre_stats) = genre_stats else {
        return Vec::new();
    };
    let mut tags: Vec<(&String, u64)> = genre_stats
        .iter()
        .map(|(tag, usage)| (tag, usage.count))
        .collect();
    tags.sort_by(|a, b| b.1.cmp(&a.1));
    tags.into_iter()
        .take(limit)
        .map(|(tag, _)| tag.clone())
        .collect()
}

fn ttl_for_rank(ttl: &TtlTuning, rank: Option<usize>) -> Duration {
    let secs = match rank {
        Some(rank) if rank < 10 => ttl.top10_tag_secs,
        Some(rank) if rank < 20 => ttl.top20_tag_secs,
        _ => ttl.other_tag_secs,
    };
    Duration::from_secs(secs)
}

fn prune(stats: &mut TagStats, now: DateTime<Utc>) -> usize {
    let cutoff = now - chrono::Duration::days(STALE_AFTER_DAYS);
    let mut removed = 0;
    for tags in stats.values_mut() {
        let before = tags.len();
        tags.retain(|_, usage| usage.last_accessed >= cutoff);
        removed += before - tags.len();
    }
    stats.retain(|_, tags| !tags.is_empty());
    removed
}

/// Reorders `default_tags` by usage count, keeping the default order among
/// equal counts.
pub fn sort_by_popularity(
    default_tags: &[String],
    genre_stats: Option<&BTreeMap<String, TagUsage>>,
) -> Vec<String> {
    let Some(genre_stats) = genre_stats else {
        return default_tags.to_vec();
    };
    let counts: HashMap<&str, u64> = genre_stats
        .iter()
        .map(|(tag, usage)| (tag.as_str(), usage.count))
        .collect();
    let mut sorted = default_tags.to_vec();
    sorted.sort_by_key(|tag| std::cmp::Reverse(counts.get(tag.as_str()).copied().unwrap_or(0)));
    sorted
}
