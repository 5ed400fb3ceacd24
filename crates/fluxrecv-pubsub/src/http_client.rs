use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::auth::{StaticToken, TokenSource};
use crate::error::Code;
use crate::names::SubscriptionName;
use crate::transport::{PullTransport, ReceivedMessage, SubscriptionConfig};
use crate::PubsubError;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// Pub/Sub REST (v1) client.
#[derive(Clone)]
pub struct HttpPubsubClient {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

fn encode_resource(resource: &str) -> String {
    resource
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl HttpPubsubClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            tokens,
        }
    }

    /// Talk to a local emulator (`host:port`) over plain http without auth.
    pub fn emulator(host: &str) -> Self {
        Self::new(format!("http://{host}"), Arc::new(StaticToken::anonymous()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, resource: &str, verb: Option<&str>) -> String {
        let mut url = format!("{}/v1/{}", self.base_url, encode_resource(resource));
        if let Some(verb) = verb {
            url.push(':');
            url.push_str(verb);
        }
        url
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> Result<reqwest::RequestBuilder, PubsubError> {
        let mut builder = self.client.request(method, url);
        if let Some(token) = self.tokens.token().await? {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PubsubError> {
        let resp = builder.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(status_error(resp).await)
    }
}

async fn status_error(resp: reqwest::Response) -> PubsubError {
    let http_status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let code = Code::from_status_name(&envelope.error.status)
                .unwrap_or_else(|| Code::from_http_status(http_status));
            PubsubError::status(code, envelope.error.message)
        }
        Err(_) => PubsubError::status(Code::from_http_status(http_status), body),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest<'a> {
    topic: &'a str,
    ack_deadline_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl TryFrom<WireReceivedMessage> for ReceivedMessage {
    type Error = PubsubError;

    fn try_from(wire: WireReceivedMessage) -> Result<Self, Self::Error> {
        let data = BASE64_STANDARD.decode(wire.message.data.as_bytes()).map_err(|e| {
            PubsubError::Decode(format!("message {}: {e}", wire.message.message_id))
        })?;
        Ok(ReceivedMessage {
            ack_id: wire.ack_id,
            message_id: wire.message.message_id,
            data: Bytes::from(data),
            attributes: wire.message.attributes,
            publish_time: wire.message.publish_time,
            delivery_attempt: wire.delivery_attempt,
        })
    }
}

// ---------------------------------------------------------------------------
// PullTransport impl
// ---------------------------------------------------------------------------

#[async_trait]
impl PullTransport for HttpPubsubClient {
    async fn create_subscription(
        &self,
        name: &SubscriptionName,
        config: &SubscriptionConfig,
    ) -> Result<(), PubsubError> {
        let url = self.endpoint(name.as_str(), None);
        let body = CreateSubscriptionRequest {
            topic: config.topic.as_str(),
            ack_deadline_seconds: config.ack_deadline.as_secs(),
        };
        let builder = self.request(reqwest::Method::PUT, url).await?.json(&body);
        self.send(builder).await?;
        Ok(())
    }

    async fn get_subscription(&self, name: &SubscriptionName) -> Result<(), PubsubError> {
        let url = self.endpoint(name.as_str(), None);
        let builder = self.request(reqwest::Method::GET, url).await?;
        self.send(builder).await?;
        Ok(())
    }

    async fn pull(
        &self,
        name: &SubscriptionName,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubsubError> {
        let url = self.endpoint(name.as_str(), Some("pull"));
        let builder = self
            .request(reqwest::Method::POST, url)
            .await?
            .json(&PullRequest { max_messages });
        let resp = self.send(builder).await?;

        // An empty pull comes back as `{}`.
        let body = resp.bytes().await?;
        let parsed: PullResponse = if body.is_empty() {
            PullResponse::default()
        } else {
            serde_json::from_slice(&body)?
        };

        parsed
            .received_messages
            .into_iter()
            .map(ReceivedMessage::try_from)
            .collect()
    }

    async fn acknowledge(
        &self,
        name: &SubscriptionName,
        ack_ids: &[String],
    ) -> Result<(), PubsubError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(name.as_str(), Some("acknowledge"));
        let builder = self
            .request(reqwest::Method::POST, url)
            .await?
            .json(&AcknowledgeRequest { ack_ids });
        self.send(builder).await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        name: &SubscriptionName,
        ack_ids: &[String],
        deadline: Duration,
    ) -> Result<(), PubsubError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(name.as_str(), Some("modifyAckDeadline"));
        let builder = self
            .request(reqwest::Method::POST, url)
            .await?
            .json(&ModifyAckDeadlineRequest {
                ack_ids,
                ack_deadline_seconds: deadline.as_secs(),
            });
        self.send(builder).await?;
        Ok(())
    }
}
