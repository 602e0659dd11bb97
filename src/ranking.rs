//! Ranking domain types shared by the fetchers, the cache and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Upstream genre id of the sensitive-content genre. Never served.
pub const SENSITIVE_GENRE_ID: &str = "d2um7mc4";

macro_rules! genres {
    ($($variant:ident => $slug:literal, $id:literal;)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Genre {
            $($variant,)+
        }

        impl Genre {
            pub const ALL: &'static [Genre] = &[$(Genre::$variant,)+];

            pub fn slug(self) -> &'static str {
                match self {
                    $(Genre::$variant => $slug,)+
                }
            }

            /// Id used in upstream URLs.
            pub fn upstream_id(self) -> &'static str {
                match self {
                    $(Genre::$variant => $id,)+
                }
            }
        }
    };
}

genres! {
    All => "all", "all";
    Game => "game", "4eet3ca4";
    Anime => "anime", "zc49b03a";
    Vocaloid => "vocaloid", "dshv5do5";
    Vtuber => "vtuber", "e2bi9pt8";
    Entertainment => "entertainment", "8kjl94d9";
    Radio => "radio", "oxzi6bje";
    Music => "music", "wq76qdin";
    Sing => "sing", "1ya6bnqd";
    Dance => "dance", "6yuf530c";
    Play => "play", "6r5jr8nd";
    Lecture => "lecture", "v6wdx6p5";
    Cooking => "cooking", "lq8d5918";
    Travel => "travel", "k1libcse";
    Nature => "nature", "24aa8fkw";
    Vehicle => "vehicle", "3d8zlls9";
    Animal => "animal", "ne72lua2";
    Sports => "sports", "4w3p65pf";
    Tech => "tech", "n46kcz9u";
    Society => "society", "lzicx0y6";
    Mmd => "mmd", "p1acxuoz";
    Other => "other", "ramuboyn";
}

impl FromStr for Genre {
    type Err = QueryError;

    /// Accepts either the slug or the upstream id.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(SENSITIVE_GENRE_ID) {
            return Err(QueryError::SensitiveGenre);
        }
        Genre::ALL
            .iter()
            .copied()
            .find(|genre| genre.slug().eq_ignore_ascii_case(raw) || genre.upstream_id() == raw)
            .ok_or_else(|| QueryError::UnknownGenre(raw.to_string()))
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl Serialize for Genre {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.slug())
    }
}

impl<'de> Deserialize<'de> for Genre {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "hour")]
    Hour,
}

impl Period {
    pub const ALL: &'static [Period] = &[Period::Day, Period::Hour];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Day => "24h",
            Period::Hour => "hour",
        }
    }
}

impl FromStr for Period {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "24h" => Ok(Period::Day),
            "hour" => Ok(Period::Hour),
            other => Err(QueryError::UnknownPeriod(other.to_string())),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown genre {0:?}")]
    UnknownGenre(String),
    #[error("sensitive genre is not available")]
    SensitiveGenre,
    #[error("unknown period {0:?}; expected 24h or hour")]
    UnknownPeriod(String),
    #[error("page must be a positive integer")]
    InvalidPage,
    #[error("tag must be at most {max} characters")]
    TagTooLong { max: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingItem {
    pub rank: u32,
    pub id: String,
    pub title: String,
    #[serde(rename = "thumbURL")]
    pub thumb_url: String,
    pub views: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mylists: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
    #[serde(default)]
    pub require_sensitive_masking: bool,
}

/// Which upstream produced a page or snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Api,
    Html,
    Hybrid,
}

/// Cached genre ranking: already NG-filtered and ranked from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSnapshot {
    pub items: Vec<RankingItem>,
    #[serde(default)]
    pub popular_tags: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub source: Source,
}

/// Cached page of a tag ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPage {
    pub items: Vec<RankingItem>,
    pub page: u32,
    pub updated_at: DateTime<Utc>,
    pub source: Source,
}

pub const MAX_TAG_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingQuery {
    pub genre: Genre,
    pub period: Period,
    pub tag: Option<String>,
    pub page: u32,
}

impl RankingQuery {
    /// Validates raw query-string values. Missing genre/period default to
    /// `all` and `24h`; a blank tag counts as no tag.
    pub fn parse(
        genre: Option<&str>,
        period: Option<&str>,
        tag: Option<&str>,
        page: Option<&str>,
    ) -> Result<Self, QueryError> {
        let genre = genre
            .filter(|raw| !raw.trim().is_empty())
            .map(str::parse)
            .transpose()?
            .unwrap_or(Genre::All);
        let period = period
            .filter(|raw| !raw.trim().is_empty())
            .map(str::parse)
            .transpose()?
            .unwrap_or(Period::Day);
        let tag = tag
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string);
        if let Some(tag) = &tag
            && tag.chars().count() > MAX_TAG_LEN
        {
            return Err(QueryError::TagTooLong { max: MAX_TAG_LEN });
        }
        let page = match page.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => 1,
            Some(raw) => match raw.parse::<u32>() {
                Ok(page) if page >= 1 => page,
                _ => return Err(QueryError::InvalidPage),
            },
        };
        Ok(Self {
            genre,
            period,
            tag,
            page,
        })
    }

    pub fn cache_key(&self) -> String {
        match &self.tag {
            Some(tag) => tag_page_key(self.genre, self.period, tag, self.page),
            None => snapshot_key(self.genre, self.period),
        }
    }
}

pub fn snapshot_key(genre: Genre, period: Period) -> String {
    format!("ranking-{}-{}", genre.slug(), period.as_str())
}

pub fn tag_page_key(genre: Genre, period: Period, tag: &str, page: u32) -> String {
    let base = format!("ranking-{}-{}-tag-{}", genre.slug(), period.as_str(), tag);
    if page > 1 {
        format!("{base}-page{page}")
    } else {
        base
    }
}

/// Rewrites ranks as `offset + 1, offset + 2, ...` in list order.
pub fn rerank(items: &mut [RankingItem], offset: u32) {
    for (index, item) in items.iter_mut().enumerate() {
        item.rank = offset + index as u32 + 1;
    }
}
