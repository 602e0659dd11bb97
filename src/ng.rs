//! NG (deny-list) filtering of ranking items and the KV-backed list store.

use crate::{
    kv::Kv,
    ranking::{RankingItem, rerank},
};
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

pub const MANUAL_KEY: &str = "ng-list-manual";
pub const DERIVED_KEY: &str = "ng-list-derived";
const MEMO_TTL: Duration = Duration::from_secs(60);

/// Exact and substring rules for one text field. Older stores kept a plain
/// array, which reads as exact rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TextRulesRepr")]
pub struct TextRules {
    pub exact: Vec<String>,
    pub partial: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextRulesRepr {
    Rules {
        #[serde(default)]
        exact: Vec<String>,
        #[serde(default)]
        partial: Vec<String>,
    },
    Exact(Vec<String>),
}

impl From<TextRulesRepr> for TextRules {
    fn from(repr: TextRulesRepr) -> Self {
        match repr {
            TextRulesRepr::Rules { exact, partial } => Self { exact, partial },
            TextRulesRepr::Exact(exact) => Self {
                exact,
                partial: Vec::new(),
            },
        }
    }
}

impl TextRules {
    pub fn matches(&self, text: &str) -> bool {
        self.exact
            .iter()
            .any(|rule| !rule.is_empty() && rule == text)
            || self
                .partial
                .iter()
                .any(|rule| !rule.is_empty() && text.contains(rule.as_str()))
    }

    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.partial.is_empty()
    }
}

/// Rules maintained by hand through the admin endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManualNgList {
    pub video_ids: Vec<String>,
    pub video_titles: TextRules,
    pub author_ids: Vec<String>,
    pub author_names: TextRules,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NgList {
    #[serde(flatten)]
    pub manual: ManualNgList,
    #[serde(default)]
    pub derived_video_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NgFilterResult {
    pub items: Vec<RankingItem>,
    /// Ids removed by a title or author rule that are not derived yet.
    pub new_derived_ids: Vec<String>,
}

impl NgList {
    pub fn is_empty(&self) -> bool {
        self.manual.video_ids.is_empty()
            && self.manual.video_titles.is_empty()
            && self.manual.author_ids.is_empty()
            && self.manual.author_names.is_empty()
            && self.derived_video_ids.is_empty()
    }

    /// Drops NG items and re-ranks the survivors from `rank_offset + 1`.
    pub fn filter(&self, mut items: Vec<RankingItem>, rank_offset: u32) -> NgFilterResult {
        if self.is_empty() {
            rerank(&mut items, rank_offset);
            return NgFilterResult {
                items,
                new_derived_ids: Vec::new(),
            };
        }
        let blocked_ids: HashSet<&str> = self
            .manual
            .video_ids
            .iter()
            .chain(&self.derived_video_ids)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
            .collect();
        let author_ids: HashSet<&str> = self
            .manual
            .author_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.is_empty())
            .collect();

        let mut new_derived_ids: Vec<String> = Vec::new();
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            if blocked_ids.contains(item.id.as_str()) {
                continue;
            }
            let by_rule = self.manual.video_titles.matches(&item.title)
                || item
                    .author_id
                    .as_deref()
                    .is_some_and(|id| author_ids.contains(id))
                || item
                    .author_name
                    .as_deref()
                    .is_some_and(|name| self.manual.author_names.matches(name));
            if by_rule {
                if !new_derived_ids.contains(&item.id) {
                    new_derived_ids.push(item.id);
                }
                continue;
            }
            kept.push(item);
        }

        rerank(&mut kept, rank_offset);
        NgFilterResult {
            items: kept,
            new_derived_ids,
        }
    }
}

struct Memo {
    loaded_at: Instant,
    list: Arc<NgList>,
}

/// Every write bumps `generation`, so a read that started before the write
/// can tell its result is outdated.
#[derive(Default)]
struct MemoState {
    generation: u64,
    memo: Option<Memo>,
}

/// NG list persisted in KV with a short in-process memo.
#[derive(Clone)]
pub struct NgStore {
    kv: Kv,
    memo: Arc<Mutex<MemoState>>,
    writes: Arc<tokio::sync::Mutex<()>>,
}

impl NgStore {
    pub fn new(kv: Kv) -> Self {
        Self {
            kv,
            memo: Arc::new(Mutex::new(MemoState::default())),
            writes: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Current list. KV failures yield an empty list rather than an error so
    /// rankings keep flowing.
    pub async fn load(&self) -> Arc<NgList> {
        let generation = match self.memoized() {
            Ok(list) => return list,
            Err(generation) => generation,
        };

        match self.read().await {
            Ok(list) => {
                let list = Arc::new(list);
                self.remember(generation, list.clone());
                list
            }
            Err(err) => {
                tracing::warn!(error = %err, "ng list unavailable; filtering with an empty list");
                Arc::new(NgList::default())
            }
        }
    }

    async fn read(&self) -> Result<NgList> {
        let manual = self
            .kv
            .get_json::<ManualNgList>(MANUAL_KEY)
            .await?
            .map(|cached| cached.value)
            .unwrap_or_default();
        let derived_video_ids = self.read_derived().await?;
        Ok(NgList {
            manual,
            derived_video_ids,
        })
    }

    async fn read_derived(&self) -> Result<Vec<String>> {
        Ok(self
            .kv
            .get_json::<Vec<String>>(DERIVED_KEY)
            .await?
            .map(|cached| cached.value)
            .unwrap_or_default())
    }

    /// The memoized list, or the generation a fresh read must still match
    /// to be memoized.
    fn memoized(&self) -> Result<Arc<NgList>, u64> {
        let state = self.memo.lock();
        match &state.memo {
            Some(memo) if memo.loaded_at.elapsed() < MEMO_TTL => Ok(memo.list.clone()),
            _ => Err(state.generation),
        }
    }

    fn remember(&self, generation: u64, list: Arc<NgList>) {
        let mut state = self.memo.lock();
        if state.generation != generation {
            tracing::debug!("ng list changed during read; not memoized");
            return;
        }
        state.memo = Some(Memo {
            loaded_at: Instant::now(),
            list,
        });
    }

    fn invalidate(&self) {
        let mut state = self.memo.lock();
        state.generation = state.generation.wrapping_add(1);
        state.memo = None;
    }

    pub async fn save_manual(&self, manual: &ManualNgList) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.kv.put_json(MANUAL_KEY, manual, None).await?;
        self.invalidate();
        tracing::info!(
            video_ids = manual.video_ids.len(),
            author_ids = manual.author_ids.len(),
            "saved manual ng list"
        );
        Ok(())
    }

    /// Appends ids to the derived list, keeping existing order. Returns how
    /// many were new.
    pub async fn add_derived(&self, ids: &[String]) -> Result<usize> {
        if ids.iter().all(|id| id.is_empty()) {
            return Ok(0);
        }
        let _guard = self.writes.lock().await;
        let mut derived = self.read_derived().await?;
        let mut seen: HashSet<String> = derived.iter().cloned().collect();
        let before = derived.len();
        for id in ids {
            if !id.is_empty() && seen.insert(id.clone()) {
                derived.push(id.clone());
            }
        }
        let added = derived.len() - before;
        if added > 0 {
            self.kv.put_json(DERIVED_KEY, &derived, None).await?;
            self.invalidate();
            tracing::info!(added, total = derived.len(), "extended derived ng list");
        }
        Ok(added)
    }

    pub async fn clear_derived(&self) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.kv
            .put_json(DERIVED_KEY, &Vec::<String>::new(), None)
            .await?;
        self.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::fake::{item, items};

    fn author(id: &str, author_id: &str, name: &str, title: &str) -> RankingItem {
        let mut item = item(id);
        item.author_id = Some(author_id.into());
        item.author_name = Some(name.into());
        item.title = title.into();
        item
    }

    #[test]
    fn filter_applies_each_rule_and_reranks() {
        let list = NgList {
            manual: ManualNgList {
                video_ids: vec!["sm1".into()],
                video_titles: TextRules {
                    exact: vec!["exact title".into()],
                    partial: vec!["spoiler".into()],
                },
                author_ids: vec!["u9".into()],
                author_names: TextRules {
                    exact: vec!["bad".into()],
                    partial: vec!["bot".into()],
                },
            },
            derived_video_ids: vec!["sm2".into()],
        };
        let input = vec![
            author("sm1", "u1", "a", "t"),
            author("sm2", "u1", "a", "t"),
            author("sm3", "u1", "a", "exact title"),
            author("sm4", "u1", "a", "big spoiler inside"),
            author("sm5", "u9", "a", "t"),
            author("sm6", "u1", "bad", "t"),
            author("sm7", "u1", "robot", "t"),
            author("sm8", "u1", "badger", "exact title!"),
        ];
        let result = list.filter(input, 100);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].id, "sm8");
        assert_eq!(result.items[0].rank, 101);
        assert_eq!(
            result.new_derived_ids,
            vec!["sm3", "sm4", "sm5", "sm6", "sm7"]
        );
    }

    #[test]
    fn empty_patterns_never_match() {
        let list = NgList {
            manual: ManualNgList {
                video_ids: vec![String::new()],
                video_titles: TextRules {
                    exact: vec![String::new()],
                    partial: vec![String::new()],
                },
                author_ids: vec![String::new()],
                author_names: TextRules {
                    exact: vec![String::new()],
                    partial: vec![String::new()],
                },
            },
            derived_video_ids: vec![],
        };
        let mut no_author = item("sm1");
        no_author.title = String::new();
        let result = list.filter(vec![no_author, author("sm2", "", "", "")], 0);
        assert_eq!(result.items.len(), 2);
        assert!(result.new_derived_ids.is_empty());
    }

    #[test]
    fn empty_list_keeps_everything() {
        let list = NgList::default();
        assert!(list.is_empty());
        let result = list.filter(items("sm", 3), 0);
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.items[2].rank, 3);
    }

    #[test]
    fn legacy_plain_title_array_reads_as_exact() {
        let manual: ManualNgList =
            serde_json::from_str(r#"{"videoIds":["sm1"],"videoTitles":["a","b"]}"#).unwrap();
        assert_eq!(manual.video_titles.exact, vec!["a", "b"]);
        assert!(manual.video_titles.partial.is_empty());
        assert!(manual.author_names.is_empty());
    }

    #[tokio::test]
    async fn store_round_trips_and_merges_derived() {
        let store = NgStore::new(Kv::memory(Duration::from_secs(60)));
        assert!(store.load().await.is_empty());

        let manual = ManualNgList {
            video_ids: vec!["sm1".into()],
            ..ManualNgList::default()
        };
        store.save_manual(&manual).await.unwrap();
        assert_eq!(
            store
                .add_derived(&["sm2".into(), "sm3".into()])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .add_derived(&["sm3".into(), "sm4".into(), String::new()])
                .await
                .unwrap(),
            1
        );

        let list = store.load().await;
        assert_eq!(list.manual, manual);
        assert_eq!(list.derived_video_ids, vec!["sm2", "sm3", "sm4"]);

        store.clear_derived().await.unwrap();
        assert!(store.load().await.derived_video_ids.is_empty());
        assert_eq!(store.load().await.manual, manual);
    }

    #[tokio::test]
    async fn load_is_memoized_until_a_write() {
        let kv = Kv::memory(Duration::from_secs(60));
        let store = NgStore::new(kv.clone());
        assert!(store.load().await.is_empty());

        // Written behind the store's back: the memo hides it.
        kv.put_json(DERIVED_KEY, &vec!["sm9".to_string()], None)
            .await
            .unwrap();
        assert!(store.load().await.derived_video_ids.is_empty());

        store.add_derived(&["sm10".into()]).await.unwrap();
        assert_eq!(store.load().await.derived_video_ids, vec!["sm9", "sm10"]);
    }

    #[tokio::test]
    async fn read_overtaken_by_a_write_is_not_memoized() {
        let store = NgStore::new(Kv::memory(Duration::from_secs(60)));
        let generation = store.memoized().unwrap_err();
        let before_write = Arc::new(store.read().await.unwrap());

        let manual = ManualNgList {
            video_ids: vec!["sm1".into()],
            ..ManualNgList::default()
        };
        store.save_manual(&manual).await.unwrap();
        store.remember(generation, before_write);
        assert_eq!(store.load().await.manual, manual);

        // a read at the current generation is kept
        let current = store.memoized().unwrap();
        assert!(Arc::ptr_eq(&current, &store.load().await));
    }
}
