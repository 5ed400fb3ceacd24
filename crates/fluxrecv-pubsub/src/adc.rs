//! Application Default Credentials read from a JSON file.
//!
//! Two kinds of file are understood: service account keys, exchanged for an
//! access token with a self-signed JWT, and the `authorized_user` file that
//! `gcloud auth application-default login` writes, exchanged with its
//! refresh token.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::prelude::*;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{AccessTokenResponse, TokenCache, TokenSource};
use crate::PubsubError;

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

impl CredentialsFile {
    pub fn from_json(json: &str) -> Result<Self, PubsubError> {
        serde_json::from_str(json)
            .map_err(|e| PubsubError::Credentials(format!("unsupported credentials file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, PubsubError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PubsubError::Credentials(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialsFile::ServiceAccount(_) => "service_account",
            CredentialsFile::AuthorizedUser(_) => "authorized_user",
        }
    }

    /// The key's own project, or the quota project of user credentials.
    pub fn project_id(&self) -> Option<&str> {
        let project = match self {
            CredentialsFile::ServiceAccount(key) => key.project_id.as_deref(),
            CredentialsFile::AuthorizedUser(user) => user.quota_project_id.as_deref(),
        };
        project.filter(|p| !p.is_empty())
    }

    pub fn into_token_source(self) -> Result<Arc<dyn TokenSource>, PubsubError> {
        Ok(match self {
            CredentialsFile::ServiceAccount(key) => Arc::new(ServiceAccount::new(key)?),
            CredentialsFile::AuthorizedUser(user) => Arc::new(UserRefreshToken::new(user)),
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, PubsubError> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    BASE64_STANDARD
        .decode(body)
        .map_err(|e| PubsubError::Credentials(format!("invalid private key encoding: {e}")))
}

async fn exchange(
    client: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<AccessTokenResponse, PubsubError> {
    let resp = client
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|e| PubsubError::Credentials(format!("token endpoint unreachable: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PubsubError::Credentials(format!(
            "token request failed ({status}): {}",
            body.trim()
        )));
    }
    resp.json()
        .await
        .map_err(|e| PubsubError::Credentials(format!("invalid token response: {e}")))
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Service account key: signs an RS256 assertion and trades it for a token.
pub struct ServiceAccount {
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    key_pair: RsaKeyPair,
    rng: SystemRandom,
    client: reqwest::Client,
    cached: TokenCache,
}

impl ServiceAccount {
    pub fn new(key: ServiceAccountKey) -> Result<Self, PubsubError> {
        let der = pem_to_der(&key.private_key)?;
        let key_pair = RsaKeyPair::from_pkcs8(&der).map_err(|e| {
            PubsubError::Credentials(format!("invalid service account private key: {e}"))
        })?;
        Ok(Self {
            client_email: key.client_email,
            key_id: key.private_key_id.filter(|id| !id.is_empty()),
            token_uri: key.token_uri,
            key_pair,
            rng: SystemRandom::new(),
            client: reqwest::Client::new(),
            cached: TokenCache::default(),
        })
    }

    fn assertion(&self, issued_at: u64) -> Result<String, PubsubError> {
        let header = JwtHeader {
            alg: "RS256",
            typ: "JWT",
            kid: self.key_id.as_deref(),
        };
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: PUBSUB_SCOPE,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let mut jwt = format!(
            "{}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );

        let mut signature = vec![0; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, jwt.as_bytes(), &mut signature)
            .map_err(|_| PubsubError::Credentials("failed to sign token request".into()))?;
        jwt.push('.');
        jwt.push_str(&BASE64_URL_SAFE_NO_PAD.encode(signature));
        Ok(jwt)
    }

    async fn fetch_token(&self) -> Result<AccessTokenResponse, PubsubError> {
        let assertion = self.assertion(unix_now())?;
        let resp = exchange(
            &self.client,
            &self.token_uri,
            &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
        )
        .await?;
        debug!(client_email = %self.client_email, expires_in = resp.expires_in, "Fetched access token for service account");
        Ok(resp)
    }
}

#[async_trait]
impl TokenSource for ServiceAccount {
    async fn token(&self) -> Result<Option<String>, PubsubError> {
        self.cached.get_or_fetch(|| self.fetch_token()).await.map(Some)
    }
}

/// gcloud user credentials: a long-lived refresh token.
pub struct UserRefreshToken {
    user: AuthorizedUser,
    client: reqwest::Client,
    cached: TokenCache,
}

impl UserRefreshToken {
    pub fn new(user: AuthorizedUser) -> Self {
        Self {
            user,
            client: reqwest::Client::new(),
            cached: TokenCache::default(),
        }
    }

    async fn fetch_token(&self) -> Result<AccessTokenResponse, PubsubError> {
        let resp = exchange(
            &self.client,
            &self.user.token_uri,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.user.client_id.as_str()),
                ("client_secret", self.user.client_secret.as_str()),
                ("refresh_token", self.user.refresh_token.as_str()),
            ],
        )
        .await?;
        debug!(expires_in = resp.expires_in, "Refreshed user access token");
        Ok(resp)
    }
}

#[async_trait]
impl TokenSource for UserRefreshToken {
    async fn token(&self) -> Result<Option<String>, PubsubError> {
        self.cached.get_or_fetch(|| self.fetch_token()).await.map(Some)
    }
}
