//! Apple Push Notification service sender.
//!
//! One HTTP/2 `POST /3/device/<token>` per device token, authenticated with an
//! ES256 provider token. Requests for a batch run concurrently up to
//! `ApnsConfig::concurrency` in flight.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use fanout_common::channel::{ChannelError, ChannelSender, PushRequest, PushResponse, TokenOutcome};
use fanout_common::config::ApnsSettings;

pub const PRODUCTION_ENDPOINT: &str = "https://api.push.apple.com";
pub const SANDBOX_ENDPOINT: &str = "https://api.sandbox.push.apple.com";

/// Apple rejects provider tokens older than one hour.
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

const DEFAULT_CONCURRENCY: usize = 32;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reasons after which the cached provider token must be re-signed.
const STALE_TOKEN_REASONS: [&str; 2] = ["ExpiredProviderToken", "InvalidProviderToken"];

#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub key_id: String,
    pub team_id: String,
    /// PEM-encoded PKCS#8 signing key (the contents of the `.p8` file).
    pub signing_key: String,
    /// App bundle identifier.
    pub topic: String,
    pub endpoint: String,
    pub concurrency: usize,
}

impl ApnsConfig {
    /// Build from environment settings, reading the signing key from disk.
    pub fn from_settings(settings: &ApnsSettings) -> Result<Self, ChannelError> {
        let signing_key = std::fs::read_to_string(&settings.key_path).map_err(|e| {
            ChannelError::Auth(format!(
                "cannot read APNs signing key {}: {}",
                settings.key_path, e
            ))
        })?;

        Ok(Self {
            key_id: settings.key_id.clone(),
            team_id: settings.team_id.clone(),
            signing_key,
            topic: settings.topic.clone(),
            endpoint: if settings.sandbox {
                SANDBOX_ENDPOINT.to_string()
            } else {
                PRODUCTION_ENDPOINT.to_string()
            },
            concurrency: DEFAULT_CONCURRENCY,
        })
    }
}

/// Collected per-token results of one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApnsResponse {
    pub sent: Vec<String>,
    pub failed: Vec<ApnsFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApnsFailure {
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ApnsReason>,
    /// Transport error text when no HTTP response was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body returned by APNs, e.g. `{"reason":"BadDeviceToken"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnsReason {
    pub reason: String,
}

impl ApnsFailure {
    fn transport(device: &str, error: impl ToString) -> Self {
        Self {
            device: device.to_string(),
            status: None,
            response: None,
            error: Some(error.to_string()),
        }
    }

    /// Human-readable detail stored on the delivery record.
    pub fn detail(&self) -> String {
        if let Some(response) = &self.response {
            return response.reason.clone();
        }
        if let Some(status) = self.status {
            return format!("HTTP {}", status);
        }
        self.error
            .clone()
            .unwrap_or_else(|| "unknown APNs failure".to_string())
    }

    fn has_stale_token(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| STALE_TOKEN_REASONS.contains(&r.reason.as_str()))
    }
}

/// Map collected APNs results into per-token outcomes.
pub fn outcomes(response: &ApnsResponse) -> PushResponse {
    let message = response
        .sent
        .iter()
        .map(TokenOutcome::delivered)
        .chain(
            response
                .failed
                .iter()
                .map(|f| TokenOutcome::failed(f.device.clone(), f.detail())),
        )
        .collect();
    PushResponse::from_outcomes(message)
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: i64,
}

struct CachedToken {
    token: String,
    issued: Instant,
}

pub struct ApnsSender {
    client: Client,
    config: ApnsConfig,
    key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
}

impl ApnsSender {
    /// Sender speaking HTTP/2 directly to the configured endpoint.
    pub fn new(config: ApnsConfig) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .http2_prior_knowledge()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Transport(format!("failed to build APNs client: {}", e)))?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: ApnsConfig, client: Client) -> Result<Self, ChannelError> {
        let key = EncodingKey::from_ec_pem(config.signing_key.as_bytes())
            .map_err(|e| ChannelError::Auth(format!("invalid APNs signing key: {}", e)))?;

        Ok(Self {
            client,
            config,
            key,
            token: Mutex::new(None),
        })
    }

    /// Current provider token, re-signed once it is older than `TOKEN_TTL`.
    fn provider_token(&self) -> Result<String, ChannelError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| ChannelError::Auth("APNs token cache poisoned".to_string()))?;

        if let Some(current) = cached.as_ref() {
            if current.issued.elapsed() < TOKEN_TTL {
                return Ok(current.token.clone());
            }
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());
        let claims = Claims {
            iss: &self.config.team_id,
            iat: chrono::Utc::now().timestamp(),
        };
        let token = jsonwebtoken::encode(&header, &claims, &self.key)
            .map_err(|e| ChannelError::Auth(format!("failed to sign APNs token: {}", e)))?;

        tracing::debug!(key_id = %self.config.key_id, "APNs provider token signed");
        *cached = Some(CachedToken {
            token: token.clone(),
            issued: Instant::now(),
        });
        Ok(token)
    }

    fn invalidate_token(&self) {
        if let Ok(mut cached) = self.token.lock() {
            *cached = None;
        }
    }

    /// `{"aps": {...}, ...payload}`
    fn build_body(request: &PushRequest) -> Value {
        let mut body = match &request.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert(
            "aps".to_string(),
            json!({
                "alert": { "title": request.message },
                "badge": request.badge,
                "sound": request.sound,
            }),
        );
        Value::Object(body)
    }

    async fn push_one(&self, token: &str, auth: &str, body: &Value) -> Result<String, ApnsFailure> {
        let url = format!(
            "{}/3/device/{}",
            self.config.endpoint.trim_end_matches('/'),
            token
        );

        let response = self
            .client
            .post(&url)
            .header("authorization", format!("bearer {}", auth))
            .header("apns-topic", self.config.topic.as_str())
            .header("apns-push-type", "alert")
            .json(body)
            .send()
            .await
            .map_err(|e| ApnsFailure::transport(token, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(token.to_string());
        }

        let reason = response.json::<ApnsReason>().await.ok();
        Err(ApnsFailure {
            device: token.to_string(),
            status: Some(status.as_u16()),
            response: reason,
            error: None,
        })
    }
}

#[async_trait]
impl ChannelSender for ApnsSender {
    fn method(&self) -> &'static str {
        "apn"
    }

    async fn send(&self, request: &PushRequest) -> Result<PushResponse, ChannelError> {
        let auth = self.provider_token()?;
        let body = Self::build_body(request);

        let (auth, body) = (&auth, &body);
        let results: Vec<Result<String, ApnsFailure>> = stream::iter(request.tokens.iter().cloned())
            .map(|token| async move { self.push_one(&token, auth, body).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut response = ApnsResponse::default();
        for result in results {
            match result {
                Ok(token) => response.sent.push(token),
                Err(failure) => response.failed.push(failure),
            }
        }

        if response.failed.iter().any(ApnsFailure::has_stale_token) {
            tracing::warn!("APNs rejected the provider token, it will be re-signed");
            self.invalidate_token();
        }

        tracing::debug!(
            sent = response.sent.len(),
            failed = response.failed.len(),
            "APNs batch finished"
        );
        Ok(outcomes(&response))
    }
}
