//! Browser-held ranking state and how it is reconciled against a fresh page
//! when the user navigates back to a ranking.

use crate::{
    pipeline::RankingPage,
    ranking::{Genre, MAX_TAG_LEN, Period, RankingItem, RankingQuery},
};
use serde::{Deserialize, Serialize};

/// Saved states older than this are ignored.
pub const STATE_MAX_AGE_MS: i64 = 30 * 60 * 1000;

/// Upper bound on pages a restored tag ranking asks the client to reload.
pub const MAX_RESTORE_PAGES: u32 = 10;

const MIN_UPDATE_INTERVAL_MS: u64 = 30_000;
const MAX_UPDATE_INTERVAL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_UPDATE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingConfig {
    pub genre: Genre,
    pub period: Period,
    #[serde(default)]
    pub tag: Option<String>,
}

impl RankingConfig {
    fn suffix(&self) -> String {
        format!(
            "{}-{}-{}",
            self.genre,
            self.period,
            self.tag.as_deref().filter(|t| !t.is_empty()).unwrap_or("none")
        )
    }

    pub fn storage_key(&self) -> String {
        format!("ranking-state-{}", self.suffix())
    }

    pub fn scroll_key(&self) -> String {
        format!("ranking-scroll-{}", self.suffix())
    }

    pub fn first_page_query(&self) -> RankingQuery {
        RankingQuery {
            genre: self.genre,
            period: self.period,
            tag: self.tag.clone().filter(|t| !t.trim().is_empty()),
            page: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    #[serde(default)]
    pub items: Vec<RankingItem>,
    #[serde(default)]
    pub display_count: Option<usize>,
    #[serde(default)]
    pub current_page: Option<u32>,
    #[serde(default)]
    pub has_more: Option<bool>,
    #[serde(default)]
    pub scroll_position: Option<f64>,
    /// Unix milliseconds at save time.
    pub timestamp: i64,
}

impl SavedState {
    pub fn is_usable(&self, now_ms: i64) -> bool {
        !self.items.is_empty() && now_ms.saturating_sub(self.timestamp) <= STATE_MAX_AGE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePlan {
    pub display_count: usize,
    pub current_page: u32,
    pub has_more: bool,
    /// Pages the client must load again before restoring scroll.
    pub pages_to_fetch: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<f64>,
    pub restored: bool,
}

pub fn reconcile(
    config: &RankingConfig,
    saved: Option<&SavedState>,
    fresh: &RankingPage,
    page_size: usize,
    now_ms: i64,
) -> RestorePlan {
    let page_size = page_size.max(1);
    let Some(saved) = saved.filter(|saved| saved.is_usable(now_ms)) else {
        return RestorePlan {
            display_count: page_size,
            current_page: 1,
            has_more: fresh.has_more,
            pages_to_fetch: Vec::new(),
            scroll_position: None,
            restored: false,
        };
    };

    let requested_page = saved.current_page.unwrap_or(1).max(1);
    let is_tag = config.tag.as_deref().is_some_and(|t| !t.trim().is_empty());

    let (current_page, has_more, loaded) = if is_tag {
        if fresh.items.len() < page_size {
            (1, false, fresh.items.len())
        } else {
            let saved_pages = u32::try_from(saved.items.len().div_ceil(page_size))
                .unwrap_or(u32::MAX)
                .max(1);
            let current_page = requested_page.min(saved_pages).min(MAX_RESTORE_PAGES);
            let has_more = saved.has_more != Some(false) && saved.items.len() >= page_size;
            let loaded = saved
                .items
                .len()
                .min(current_page as usize * page_size)
                .max(fresh.items.len());
            (current_page, has_more, loaded)
        }
    } else {
        let total = fresh.total_items;
        let max_page = total.div_ceil(page_size).max(1) as u32;
        let current_page = requested_page.min(max_page);
        let loaded = (current_page as usize * page_size).min(total);
        (current_page, loaded < total, loaded)
    };

    let display_count = saved
        .display_count
        .unwrap_or(page_size)
        .min(loaded)
        .max(page_size.min(loaded));

    RestorePlan {
        display_count,
        current_page,
        has_more,
        pages_to_fetch: (2..=current_page).collect(),
        scroll_position: saved.scroll_position.filter(|position| *position > 0.0),
        restored: true,
    }
}

/// Display count after one "show more" click.
pub fn show_more(display_count: usize, available: usize, page_size: usize) -> usize {
    display_count.saturating_add(page_size).min(available)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPreferences {
    pub genre: Genre,
    pub period: Period,
    pub tag: Option<String>,
    pub realtime_stats: bool,
    /// Stat polling interval in milliseconds.
    pub update_interval: u64,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            genre: Genre::All,
            period: Period::Day,
            tag: None,
            realtime_stats: true,
            update_interval: DEFAULT_UPDATE_INTERVAL_MS,
        }
    }
}

impl UserPreferences {
    pub fn sanitize(mut self) -> Self {
        self.tag = self
            .tag
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty() && tag.chars().count() <= MAX_TAG_LEN);
        self.update_interval = self
            .update_interval
            .clamp(MIN_UPDATE_INTERVAL_MS, MAX_UPDATE_INTERVAL_MS);
        self
    }
}
