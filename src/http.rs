//! Remote fetches over plain HTTP JSON endpoints.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use crate::sync::ResourceDescriptor;

/// Thin JSON-over-HTTP client used as a resource's remote fetch.
#[derive(Clone)]
pub struct HttpJsonClient {
  client: reqwest::Client,
}

impl HttpJsonClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// GET `url` and parse the body as JSON.
  pub async fn get_json(&self, url: &Url) -> Result<Value> {
    let response = self
      .client
      .get(url.clone())
      .header(reqwest::header::ACCEPT, "application/json")
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

    serde_json::from_slice(&body).map_err(|e| eyre!("Response from {} is not JSON: {}", url, e))
  }

  /// Describe `url` as a synced resource cached under `partition`.
  pub fn descriptor(
    &self,
    url: Url,
    partition: &str,
    ttl: Option<Duration>,
  ) -> ResourceDescriptor<Value> {
    let key = cache_key(&url);
    let client = self.clone();

    ResourceDescriptor::new(partition, key, ttl, move || {
      let client = client.clone();
      let url = url.clone();
      async move { client.get_json(&url).await }
    })
  }
}

/// Stable, fixed-length cache key for a URL.
pub fn cache_key(url: &Url) -> String {
  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_is_stable_and_normalized() {
    let a = Url::parse("HTTPS://API.example.com/plans?region=north").unwrap();
    let b = Url::parse("https://api.example.com/plans?region=north").unwrap();
    let c = Url::parse("https://api.example.com/plans?region=south").unwrap();

    assert_eq!(cache_key(&a), cache_key(&b));
    assert_ne!(cache_key(&a), cache_key(&c));
    assert_eq!(cache_key(&a).len(), 64);
  }

  #[test]
  fn test_descriptor_uses_hashed_key() {
    let client = HttpJsonClient::new(Duration::from_secs(1)).unwrap();
    let url = Url::parse("https://api.example.com/regions").unwrap();
    let descriptor = client.descriptor(url.clone(), "http", None);

    assert_eq!(descriptor.partition, "http");
    assert_eq!(descriptor.key, cache_key(&url));
  }
}
