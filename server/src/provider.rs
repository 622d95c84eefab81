use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, RngCore};
use reqwest::{header, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use url::Url;
use wagerboard_types::{LeaderboardEntry, LeaderboardResponse};

use crate::ServerConfig;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unrecognized leaderboard payload: {0}")]
    Decode(String),
}

impl ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ProviderError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ProviderError::Url(_) | ProviderError::Decode(_) => false,
        }
    }
}

/// Anything that can produce the current bucketed leaderboard.
#[async_trait]
pub trait LeaderboardSource: Send + Sync {
    async fn fetch(&self) -> Result<LeaderboardResponse, ProviderError>;
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_attempts: config.provider_max_attempts(),
            initial_backoff: config.provider_initial_backoff(),
            max_backoff: config.provider_max_backoff(),
        }
    }
}

/// HTTP client for the affiliate leaderboard endpoint.
pub struct AffiliateClient {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
    retry: RetryPolicy,
}

impl AffiliateClient {
    pub fn new(config: &ServerConfig) -> Result<Self, ProviderError> {
        let url = Url::parse(&config.provider_url())?;
        let http = reqwest::Client::builder()
            .timeout(config.provider_timeout())
            .build()?;
        let token = config
            .api_token
            .as_ref()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        if token.is_none() {
            tracing::warn!("API token not configured; provider requests are unauthenticated");
        }
        Ok(Self {
            http,
            url,
            token,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_once(&self) -> Result<Value, ProviderError> {
        let mut request = self
            .http
            .get(self.url.clone())
            .header(header::ACCEPT, "application/json");
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl LeaderboardSource for AffiliateClient {
    async fn fetch(&self) -> Result<LeaderboardResponse, ProviderError> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.fetch_once().await {
                Ok(raw) => return normalize(raw),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "provider fetch failed, retrying: {err}"
                    );
                    sleep(delay).await;
                    backoff = backoff.saturating_mul(2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // Delay is in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

enum Shape {
    Bucketed,
    /// Entry list at the root (`""`) or under the named key.
    Flat(&'static str),
}

fn shape(raw: &Value) -> Result<Shape, ProviderError> {
    let object = match raw {
        Value::Array(_) => return Ok(Shape::Flat("")),
        Value::Object(object) => object,
        other => {
            return Err(ProviderError::Decode(format!(
                "expected object or array, got {other}"
            )))
        }
    };
    let data = object.get("data").filter(|value| !value.is_null());
    let results = object.get("results").filter(|value| !value.is_null());
    match (data, results) {
        (Some(Value::Array(_)), _) => Ok(Shape::Flat("data")),
        (Some(Value::Object(_)), _) | (None, None) => Ok(Shape::Bucketed),
        (Some(other), _) => Err(ProviderError::Decode(format!(
            "expected an object or entry list under data, got {other}"
        ))),
        (None, Some(Value::Array(_))) => Ok(Shape::Flat("results")),
        (None, Some(other)) => Err(ProviderError::Decode(format!(
            "expected an entry list under results, got {other}"
        ))),
    }
}

/// Converts a provider payload into the bucketed leaderboard shape.
///
/// Any object under `data` (or no `data` at all) is read as the bucketed
/// shape, so a missing period stays missing. Flat entry lists
/// (`{data: [...]}`, `{results: [...]}` or a bare array) are bucketed by
/// ranking every period.
pub fn normalize(raw: Value) -> Result<LeaderboardResponse, ProviderError> {
    let list = match shape(&raw)? {
        Shape::Bucketed => {
            return serde_json::from_value(raw).map_err(|err| ProviderError::Decode(err.to_string()))
        }
        Shape::Flat(key) => match raw {
            Value::Object(mut object) => object.remove(key).unwrap_or_default(),
            list => list,
        },
    };
    let entries = serde_json::from_value::<Vec<LeaderboardEntry>>(list)
        .map_err(|err| ProviderError::Decode(err.to_string()))?;
    Ok(LeaderboardResponse::from_entries(entries, Utc::now()))
}
