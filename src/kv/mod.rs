//! Key-value cache behind the ranking pipeline.
//!
//! Backends only store strings and honour a retention window. Freshness is
//! tracked by [`Kv`] inside a small JSON envelope, so an entry can be past
//! its TTL (stale) while the backend still holds it for the grace period.

mod cloudflare;
mod libsql;

pub use cloudflare::CloudflareKv;
pub use libsql::LibsqlKv;

use crate::config::KvBackendConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

/// Bodies above this size are LZMA compressed before storing.
pub const COMPRESS_THRESHOLD: usize = 64 * 1024;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value`. With `retain_for` the backend may drop it after that
    /// long; without it the value is kept until overwritten.
    async fn put(&self, key: &str, value: &str, retain_for: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Option<DateTime<Utc>>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, Some(drop_at))) if *drop_at <= now => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, retain_for: Option<Duration>) -> Result<()> {
        let drop_at = retain_for
            .map(to_chrono)
            .transpose()?
            .map(|retain| Utc::now() + retain);
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), drop_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

pub(crate) fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).context("duration out of range")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Encoding {
    Json,
    LzmaBase64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    stored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    encoding: Encoding,
    body: String,
}

/// A value read back from the cache with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub stored_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> Cached<T> {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }

    /// Time left before the entry turns stale, if it expires at all.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Typed JSON access on top of a [`KvStore`].
#[derive(Clone)]
pub struct Kv {
    store: Arc<dyn KvStore>,
    grace: Duration,
}

impl Kv {
    pub fn new(store: Arc<dyn KvStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub fn memory(grace: Duration) -> Self {
        Self::new(Arc::new(MemoryKv::new()), grace)
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Cached<T>>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        decode(&raw)
            .with_context(|| format!("decoding cached value {key}"))
            .map(Some)
    }

    /// Stores `value` as fresh for `ttl`; the backend keeps it for another
    /// grace period so it can still be served stale.
    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| to_chrono(ttl).map(|ttl| now + ttl)).transpose()?;
        let raw = encode(value, now, expires_at)?;
        let retain_for = ttl.map(|ttl| ttl + self.grace);
        self.store
            .put(key, &raw, retain_for)
            .await
            .with_context(|| format!("storing {key} in {}", self.backend_name()))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .await
            .with_context(|| format!("deleting {key} from {}", self.backend_name()))
    }
}

fn encode<T: Serialize>(
    value: &T,
    stored_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<String> {
    let json = serde_json::to_string(value).context("serializing cache value")?;
    let (encoding, body) = if json.len() > COMPRESS_THRESHOLD {
        let mut compressed = Vec::new();
        lzma_rs::lzma_compress(&mut json.as_bytes(), &mut compressed)
            .context("compressing cache value")?;
        (Encoding::LzmaBase64, STANDARD.encode(compressed))
    } else {
        (Encoding::Json, json)
    };
    let envelope = Envelope {
        stored_at,
        expires_at,
        encoding,
        body,
    };
    serde_json::to_string(&envelope).context("serializing cache envelope")
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<Cached<T>> {
    let Ok(envelope) = serde_json::from_str::<Envelope>(raw) else {
        // Plain JSON written outside this crate, e.g. by hand in a KV console.
        let value = serde_json::from_str(raw).context("parsing plain cache value")?;
        return Ok(Cached {
            value,
            stored_at: Utc::now(),
            expires_at: None,
        });
    };
    let json = match envelope.encoding {
        Encoding::Json => envelope.body,
        Encoding::LzmaBase64 => {
            let compressed = STANDARD
                .decode(envelope.body.as_bytes())
                .context("decoding base64 body")?;
            let mut json = Vec::new();
            lzma_rs::lzma_decompress(&mut compressed.as_slice(), &mut json)
                .map_err(|err| anyhow::anyhow!("decompressing body: {err:?}"))?;
            String::from_utf8(json).context("decompressed body is not utf-8")?
        }
    };
    let value = serde_json::from_str(&json).context("parsing cache body")?;
    Ok(Cached {
        value,
        stored_at: envelope.stored_at,
        expires_at: envelope.expires_at,
    })
}

/// Opens the configured backend.
pub async fn open(config: &KvBackendConfig, data_root: &Path, grace: Duration) -> Result<Kv> {
    let store: Arc<dyn KvStore> = match config {
        KvBackendConfig::Libsql { path } => {
            let path = path
                .clone()
                .unwrap_or_else(|| data_root.join("kv.db"));
            Arc::new(LibsqlKv::open(&path).await?)
        }
        KvBackendConfig::Cloudflare {
            account_id,
            namespace_id,
            api_token,
        } => Arc::new(CloudflareKv::new(account_id, namespace_id, api_token)),
        KvBackendConfig::Memory => Arc::new(MemoryKv::new()),
    };
    tracing::info!(backend = store.backend_name(), "kv store ready");
    Ok(Kv::new(store, grace))
}
