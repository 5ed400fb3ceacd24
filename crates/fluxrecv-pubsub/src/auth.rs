use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::PubsubError;

pub const METADATA_BASE_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

// Refresh a little before the server-side expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Supplies the bearer token attached to Pub/Sub requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `None` means send the request unauthenticated (emulator).
    async fn token(&self) -> Result<Option<String>, PubsubError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<Option<String>, PubsubError> {
        Ok(self.0.clone())
    }
}

/// The body every Google token endpoint answers with.
#[derive(Debug, Deserialize)]
pub(crate) struct AccessTokenResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// One access token, refetched shortly before it expires.
#[derive(Debug, Default)]
pub(crate) struct TokenCache(Mutex<Option<CachedToken>>);

impl TokenCache {
    /// Concurrent callers wait for a single fetch.
    pub(crate) async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, PubsubError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessTokenResponse, PubsubError>>,
    {
        let mut cached = self.0.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let fresh = fetch().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        let value = fresh.access_token.clone();
        *cached = Some(CachedToken {
            value: fresh.access_token,
            refresh_at: Instant::now() + lifetime,
        });
        Ok(value)
    }
}

/// Default service account credentials from the GCE metadata server.
#[derive(Debug)]
pub struct MetadataServer {
    base_url: String,
    client: reqwest::Client,
    cached: TokenCache,
}

impl Default for MetadataServer {
    fn default() -> Self {
        Self::new(METADATA_BASE_URL)
    }
}

impl MetadataServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cached: TokenCache::default(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, PubsubError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| PubsubError::Credentials(format!("metadata server unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(PubsubError::Credentials(format!(
                "metadata request {path} failed: {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    pub async fn project_id(&self) -> Result<String, PubsubError> {
        let body = self.get("/project/project-id").await?.text().await?;
        let project = body.trim();
        if project.is_empty() {
            return Err(PubsubError::Credentials(
                "metadata server returned an empty project id".into(),
            ));
        }
        Ok(project.to_string())
    }

    async fn fetch_token(&self) -> Result<AccessTokenResponse, PubsubError> {
        let resp: AccessTokenResponse = self
            .get("/instance/service-accounts/default/token")
            .await?
            .json()
            .await?;
        debug!(expires_in = resp.expires_in, "Fetched access token from metadata server");
        Ok(resp)
    }
}

#[async_trait]
impl TokenSource for MetadataServer {
    async fn token(&self) -> Result<Option<String>, PubsubError> {
        self.cached.get_or_fetch(|| self.fetch_token()).await.map(Some)
    }
}
