//! Push channel capability shared by the engine and the concrete senders.
//!
//! A channel sender delivers one request (one payload, many tokens) to a
//! platform push gateway and reports a per-token outcome. Provider-specific
//! response shapes are translated into `PushResponse` inside each sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request handed to a channel sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Display title shown on the device.
    pub message: String,
    /// Structured data delivered alongside the alert.
    pub payload: serde_json::Value,
    pub tokens: Vec<String>,
    pub badge: i32,
    pub sound: String,
}

/// Outcome for a single device token. `error` is `None` on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcome {
    pub token: String,
    pub error: Option<String>,
}

impl TokenOutcome {
    pub fn delivered(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            error: None,
        }
    }

    pub fn failed(token: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Provider response translated to per-token outcomes plus the raw counts the
/// provider reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub message: Vec<TokenOutcome>,
    pub success: u32,
    pub failure: u32,
}

impl PushResponse {
    /// Build a response whose counts are derived from the outcomes.
    pub fn from_outcomes(message: Vec<TokenOutcome>) -> Self {
        let success = message.iter().filter(|o| o.is_success()).count() as u32;
        let failure = message.len() as u32 - success;
        Self {
            message,
            success,
            failure,
        }
    }
}

/// Failure of a `send` call as a whole (not a per-token failure).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A platform push gateway.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Short transport name reported in dispatch results (e.g. `apn`, `gcm`).
    fn method(&self) -> &'static str;

    /// Deliver `request` to every token it carries.
    async fn send(&self, request: &PushRequest) -> Result<PushResponse, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_derived_from_outcomes() {
        let response = PushResponse::from_outcomes(vec![
            TokenOutcome::delivered("a"),
            TokenOutcome::failed("b", "Unregistered"),
            TokenOutcome::delivered("c"),
        ]);
        assert_eq!(response.success, 2);
        assert_eq!(response.failure, 1);
    }

    #[test]
    fn test_outcome_serializes_null_error() {
        let json = serde_json::to_value(TokenOutcome::delivered("ios1")).unwrap();
        assert_eq!(json, serde_json::json!({"token": "ios1", "error": null}));
    }
}
