//! Google Cloud Messaging sender (FCM legacy HTTP API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fanout_common::channel::{ChannelError, ChannelSender, PushRequest, PushResponse, TokenOutcome};

pub const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// Provider limit on `registration_ids` per multicast request.
pub const MAX_TOKENS_PER_REQUEST: usize = 1000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GcmConfig {
    pub server_key: String,
    pub endpoint: String,
}

impl GcmConfig {
    pub fn new(server_key: impl Into<String>) -> Self {
        Self {
            server_key: server_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct GcmMessage<'a> {
    registration_ids: &'a [String],
    notification: GcmNotification<'a>,
    data: &'a Value,
}

#[derive(Debug, Serialize)]
struct GcmNotification<'a> {
    title: &'a str,
    badge: i32,
    sound: &'a str,
}

/// Multicast response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcmResponse {
    #[serde(default)]
    pub multicast_id: i64,
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failure: u32,
    #[serde(default)]
    pub canonical_ids: u32,
    #[serde(default)]
    pub results: Vec<GcmResult>,
}

/// One entry per requested token, in request order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcmResult {
    pub message_id: Option<String>,
    /// Canonical token to use instead of the one sent.
    pub registration_id: Option<String>,
    pub error: Option<String>,
}

/// Pair `results[i]` with `tokens[i]`. Tokens without a result are left out.
pub fn outcomes(tokens: &[String], response: &GcmResponse) -> PushResponse {
    let message = tokens
        .iter()
        .zip(&response.results)
        .map(|(token, result)| match &result.error {
            Some(error) => TokenOutcome::failed(token.clone(), error.clone()),
            None => TokenOutcome::delivered(token.clone()),
        })
        .collect();
    PushResponse::from_outcomes(message)
}

pub struct GcmSender {
    client: Client,
    config: GcmConfig,
}

impl GcmSender {
    pub fn new(config: GcmConfig) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Transport(format!("failed to build GCM client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn send_chunk(
        &self,
        request: &PushRequest,
        tokens: &[String],
    ) -> Result<GcmResponse, ChannelError> {
        let message = GcmMessage {
            registration_ids: tokens,
            notification: GcmNotification {
                title: &request.message,
                badge: request.badge,
                sound: &request.sound,
            },
            data: &request.payload,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("key={}", self.config.server_key),
            )
            .json(&message)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("GCM request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<GcmResponse>()
            .await
            .map_err(|e| ChannelError::Transport(format!("invalid GCM response: {}", e)))
    }
}

#[async_trait]
impl ChannelSender for GcmSender {
    fn method(&self) -> &'static str {
        "gcm"
    }

    /// Send every chunk. A failed chunk after another one was answered marks
    /// its own tokens failed with the provider error and keeps the answered
    /// outcomes; the call only fails when no chunk was answered.
    async fn send(&self, request: &PushRequest) -> Result<PushResponse, ChannelError> {
        let mut message = Vec::with_capacity(request.tokens.len());
        let mut answered = 0;
        let mut first_error = None;

        for tokens in request.tokens.chunks(MAX_TOKENS_PER_REQUEST) {
            match self.send_chunk(request, tokens).await {
                Ok(response) => {
                    if response.canonical_ids > 0 {
                        tracing::debug!(
                            multicast_id = response.multicast_id,
                            canonical_ids = response.canonical_ids,
                            "GCM reported canonical registration ids"
                        );
                    }
                    answered += 1;
                    message.extend(outcomes(tokens, &response).message);
                }
                Err(e) => {
                    tracing::warn!(tokens = tokens.len(), error = %e, "GCM chunk failed");
                    let detail = e.to_string();
                    message.extend(
                        tokens
                            .iter()
                            .map(|t| TokenOutcome::failed(t.clone(), detail.clone())),
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if answered == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(PushResponse::from_outcomes(message))
    }
}
