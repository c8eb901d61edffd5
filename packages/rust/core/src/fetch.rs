//! Retrieval of feed and sitemap payloads.
//!
//! The pipeline only needs "bytes for a URL"; [`Fetcher`] is the seam that
//! lets tests and offline ingestion supply payloads without a network.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;
use wikiactivity_shared::{AppConfig, Result, WikiActivityError};

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("wikiactivity/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 10;

/// A retrieved payload, as received.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    /// Final URL after redirects.
    pub url: Url,
    pub body: Vec<u8>,
    /// Stands in for missing entry timestamps.
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of `body`, hex encoded.
    pub sha256: String,
}

impl FetchedPayload {
    /// Wrap bytes obtained some other way (a file, a test fixture).
    pub fn from_bytes(url: Url, body: Vec<u8>, fetched_at: DateTime<Utc>) -> Self {
        let sha256 = compute_hash(&body);
        Self {
            url,
            body,
            fetched_at,
            sha256,
        }
    }
}

/// Something that can retrieve a payload for a URL.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<FetchedPayload>> + Send;
}

/// HTTP client options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Larger bodies are rejected.
    pub max_payload_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_payload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl From<&AppConfig> for FetchOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout_secs: config.defaults.timeout_secs,
            max_payload_bytes: config.defaults.max_payload_bytes,
        }
    }
}

/// [`Fetcher`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_payload_bytes: u64,
}

impl HttpFetcher {
    pub fn new(opts: &FetchOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(opts.timeout_secs))
            .build()
            .map_err(|e| WikiActivityError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_payload_bytes: opts.max_payload_bytes,
        })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPayload> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| WikiActivityError::fetch(url.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WikiActivityError::fetch(url.as_str(), format!("HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_payload_bytes {
                return Err(WikiActivityError::fetch(
                    url.as_str(),
                    format!("response too large ({len} bytes, max {})", self.max_payload_bytes),
                ));
            }
        }

        let final_url = response.url().clone();
        let fetched_at = Utc::now();

        // Content-Length may be absent or wrong, so the limit is also enforced
        // while streaming.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| WikiActivityError::fetch(url.as_str(), format!("failed to read body: {e}")))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_payload_bytes {
                return Err(WikiActivityError::fetch(
                    url.as_str(),
                    format!("response exceeds {} bytes", self.max_payload_bytes),
                ));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %final_url, bytes = body.len(), "fetched payload");
        Ok(FetchedPayload::from_bytes(final_url, body, fetched_at))
    }
}

/// Compute SHA-256 hash of a payload.
pub fn compute_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fetcher(max_payload_bytes: u64) -> HttpFetcher {
        HttpFetcher::new(&FetchOptions {
            timeout_secs: 5,
            max_payload_bytes,
        })
        .expect("client")
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            compute_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn fetches_body_and_fingerprint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed/pages.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/feed/pages.xml", server.uri())).expect("url");
        let payload = fetcher(1024).fetch(&url).await.expect("fetch");
        assert_eq!(payload.body, b"<rss/>");
        assert_eq!(payload.sha256, compute_hash(b"<rss/>"));
        assert_eq!(payload.url, url);
    }

    #[tokio::test]
    async fn http_errors_are_fetch_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/sitemap.xml", server.uri())).expect("url");
        let err = fetcher(1024).fetch(&url).await.expect_err("503");
        assert!(matches!(err, WikiActivityError::Fetch { .. }), "{err:?}");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn oversized_payloads_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/big.xml", server.uri())).expect("url");
        let err = fetcher(100).fetch(&url).await.expect_err("too large");
        assert!(matches!(err, WikiActivityError::Fetch { .. }));
    }
}
