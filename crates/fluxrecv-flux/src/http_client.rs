use async_trait::async_trait;

use fluxrecv_core::Change;

use crate::notifier::ChangeNotifier;
use crate::FluxError;

pub const DEFAULT_API_BASE: &str = "http://localhost:3030/api/flux";

const NOTIFY_PATH: &str = "/v9/notify";

/// HTTP client for the Flux daemon API.
#[derive(Debug, Clone)]
pub struct FluxApiClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl FluxApiClient {
    /// An empty token means requests go out without an `Authorization` header.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl ChangeNotifier for FluxApiClient {
    async fn notify_change(&self, change: &Change) -> Result<(), FluxError> {
        let url = self.endpoint(NOTIFY_PATH);
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(change)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(FluxError::Api {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(())
    }
}
