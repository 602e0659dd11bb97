use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_STATS_IDS: usize = 100;

/// Live counters for one video.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStats {
    pub view_counter: u64,
    pub comment_counter: u64,
    pub mylist_counter: u64,
    pub like_counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub stats: HashMap<String, VideoStats>,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
}

impl StatsResponse {
    pub fn new(stats: HashMap<String, VideoStats>, timestamp: DateTime<Utc>) -> Self {
        let count = stats.len();
        Self {
            stats,
            timestamp,
            count,
        }
    }
}

fn is_video_id(id: &str) -> bool {
    match (id.get(..2), id.get(2..)) {
        (Some("sm" | "nm" | "so"), Some(digits)) => {
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

/// Splits a comma separated `ids` parameter, keeping the first
/// [`MAX_STATS_IDS`] distinct well-formed video ids in request order.
pub fn parse_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim) {
        if ids.len() >= MAX_STATS_IDS {
            break;
        }
        if is_video_id(id) && !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}
