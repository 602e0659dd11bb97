use super::KvStore;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
/// Cloudflare refuses `expiration_ttl` values below one minute.
const MIN_EXPIRATION_TTL: u64 = 60;

/// Workers KV namespace accessed through the Cloudflare REST API.
#[derive(Clone)]
pub struct CloudflareKv {
    agent: ureq::Agent,
    values_url: String,
    api_token: String,
}

impl CloudflareKv {
    pub fn new(account_id: &str, namespace_id: &str, api_token: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(15))
            .build();
        Self {
            agent,
            values_url: format!(
                "{API_BASE}/accounts/{account_id}/storage/kv/namespaces/{namespace_id}/values"
            ),
            api_token: api_token.to_string(),
        }
    }

    fn value_url(&self, key: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        // form encoding turns spaces into '+', which the path would keep literally
        format!("{}/{}", self.values_url, encoded.replace('+', "%20"))
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(CloudflareKv) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || op(this))
            .await
            .context("cloudflare kv task panicked")?
    }
}

pub(crate) fn expiration_ttl(retain_for: Duration) -> u64 {
    retain_for.as_secs().max(MIN_EXPIRATION_TTL)
}

#[async_trait]
impl KvStore for CloudflareKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = self.value_url(key);
        self.blocking(move |kv| {
            match kv
                .agent
                .get(&url)
                .set("Authorization", &kv.authorization())
                .call()
            {
                Ok(response) => response
                    .into_string()
                    .map(Some)
                    .context("reading cloudflare kv value"),
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(ureq::Error::Status(status, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    Err(anyhow!("cloudflare kv GET answered {status}: {body}"))
                }
                Err(err) => Err(anyhow!("cloudflare kv GET failed: {err}")),
            }
        })
        .await
    }

    async fn put(&self, key: &str, value: &str, retain_for: Option<Duration>) -> Result<()> {
        let mut url = self.value_url(key);
        if let Some(retain_for) = retain_for {
            url.push_str(&format!("?expiration_ttl={}", expiration_ttl(retain_for)));
        }
        let value = value.to_string();
        self.blocking(move |kv| {
            match kv
                .agent
                .put(&url)
                .set("Authorization", &kv.authorization())
                .set("Content-Type", "text/plain")
                .send_string(&value)
            {
                Ok(_) => Ok(()),
                Err(ureq::Error::Status(status, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    Err(anyhow!("cloudflare kv PUT answered {status}: {body}"))
                }
                Err(err) => Err(anyhow!("cloudflare kv PUT failed: {err}")),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.value_url(key);
        self.blocking(move |kv| {
            match kv
                .agent
                .delete(&url)
                .set("Authorization", &kv.authorization())
                .call()
            {
                Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
                Err(err) => Err(anyhow!("cloudflare kv DELETE failed: {err}")),
            }
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "cloudflare"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_percent_encoded_into_the_path() {
        let kv = CloudflareKv::new("acc", "ns", "token");
        assert_eq!(
            kv.value_url("ranking-game-24h-tag-a b/c"),
            "https://api.cloudflare.com/client/v4/accounts/acc/storage/kv/namespaces/ns/values/ranking-game-24h-tag-a%20b%2Fc"
        );
    }

    #[test]
    fn expiration_ttl_has_a_floor() {
        assert_eq!(expiration_ttl(Duration::from_secs(5)), 60);
        assert_eq!(expiration_ttl(Duration::from_secs(5400)), 5400);
    }
}
