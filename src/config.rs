#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SETTINGS_PATH: &str = "ranking.toml";
pub const DEFAULT_DATA_ROOT: &str = "data";
pub const DEFAULT_NICORANK_PORT: u16 = 8080;
pub const DEFAULT_NICORANK_HOST: &str = "127.0.0.1";

/// Which KV implementation backs the ranking cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvBackendConfig {
    /// Local libsql database file. `path == None` means `kv.db` under the
    /// data root.
    Libsql { path: Option<PathBuf> },
    /// Cloudflare Workers KV through its REST API.
    Cloudflare {
        account_id: String,
        namespace_id: String,
        api_token: String,
    },
    /// Process-local map. Only useful for development.
    Memory,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_root: PathBuf,
    pub www_root: Option<PathBuf>,
    pub nicorank_port: u16,
    pub nicorank_host: String,
    pub kv: KvBackendConfig,
    pub cron_secret: Option<String>,
    pub admin_key: Option<String>,
    pub settings_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub nicorank_port: Option<u16>,
    pub nicorank_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .or_else(|| lookup("DATA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from));
    let nicorank_port = overrides
        .nicorank_port
        .or_else(|| lookup("NICORANK_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_NICORANK_PORT);
    let nicorank_host = overrides
        .nicorank_host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("NICORANK_HOST"))
        .unwrap_or_else(|| DEFAULT_NICORANK_HOST.to_string());
    let settings_path = lookup("NICORANK_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

    Ok(RuntimeSettings {
        data_root,
        www_root,
        nicorank_port,
        nicorank_host,
        kv: kv_backend_from(&lookup)?,
        cron_secret: lookup("CRON_SECRET"),
        admin_key: lookup("ADMIN_KEY"),
        settings_path,
    })
}

fn kv_backend_from(lookup: &impl Fn(&str) -> Option<String>) -> Result<KvBackendConfig> {
    let backend = lookup("KV_BACKEND").unwrap_or_else(|| "libsql".to_string());
    match backend.to_ascii_lowercase().as_str() {
        "libsql" | "sqlite" => Ok(KvBackendConfig::Libsql {
            path: lookup("LIBSQL_PATH").map(PathBuf::from),
        }),
        "cloudflare" | "cf" => {
            let account_id = lookup("CLOUDFLARE_ACCOUNT_ID")
                .ok_or_else(|| anyhow!("CLOUDFLARE_ACCOUNT_ID not set"))?;
            let namespace_id = lookup("CLOUDFLARE_KV_NAMESPACE_ID")
                .ok_or_else(|| anyhow!("CLOUDFLARE_KV_NAMESPACE_ID not set"))?;
            let api_token = lookup("CLOUDFLARE_KV_API_TOKEN")
                .ok_or_else(|| anyhow!("CLOUDFLARE_KV_API_TOKEN not set"))?;
            ensure_hex_id("CLOUDFLARE_ACCOUNT_ID", &account_id)?;
            ensure_hex_id("CLOUDFLARE_KV_NAMESPACE_ID", &namespace_id)?;
            Ok(KvBackendConfig::Cloudflare {
                account_id,
                namespace_id,
                api_token,
            })
        }
        "memory" => Ok(KvBackendConfig::Memory),
        other => bail!("unknown KV_BACKEND {other:?}; expected libsql, cloudflare or memory"),
    }
}

fn ensure_hex_id(key: &str, value: &str) -> Result<()> {
    if value.len() != 32 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("{key} must be a 32-character hex string");
    }
    Ok(())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Tuning knobs read from the optional TOML settings file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub pipeline: PipelineTuning,
    pub ttl: TtlTuning,
    pub upstream: UpstreamTuning,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineTuning {
    /// Items per served page and per upstream page.
    pub page_size: usize,
    /// Filtered items kept in a genre snapshot.
    pub snapshot_target: usize,
    pub max_snapshot_pages: u32,
    /// Upstream pages tried to fill one tag page after filtering.
    pub tag_fetch_pages: u32,
    pub popular_tags_to_cache: usize,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            page_size: 100,
            snapshot_target: 300,
            max_snapshot_pages: 5,
            tag_fetch_pages: 3,
            popular_tags_to_cache: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TtlTuning {
    pub genre_secs: u64,
    pub top10_tag_secs: u64,
    pub top20_tag_secs: u64,
    pub other_tag_secs: u64,
    /// How long an expired entry stays readable for stale fallback.
    pub stale_grace_secs: u64,
}

impl Default for TtlTuning {
    fn default() -> Self {
        Self {
            genre_secs: 3600,
            top10_tag_secs: 3600,
            top20_tag_secs: 7200,
            other_tag_secs: 1800,
            stale_grace_secs: 86_400,
        }
    }
}

impl TtlTuning {
    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamTuning {
    pub requests_per_minute: usize,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for UpstreamTuning {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            timeout_secs: 15,
            retries: 3,
        }
    }
}

impl Tuning {
    /// Reads the TOML settings file. A missing file yields the defaults; a
    /// malformed one is an error so typos do not silently fall back.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let tuning: Tuning =
            toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))?;
        tuning.validate()?;
        Ok(tuning)
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.page_size == 0 {
            bail!("pipeline.page_size must be positive");
        }
        if self.pipeline.snapshot_target < self.pipeline.page_size {
            bail!("pipeline.snapshot_target must be at least pipeline.page_size");
        }
        if self.upstream.requests_per_minute == 0 {
            bail!("upstream.requests_per_minute must be positive");
        }
        Ok(())
    }
}
