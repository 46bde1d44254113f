//! Channel dispatcher.
//!
//! Routes platform groups to their channel senders.
//!
//! One `send` call per group. The sender's outcomes are normalized so that
//! the result lists every requested token exactly once, in request order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;

use fanout_common::channel::{ChannelError, ChannelSender, PushRequest, PushResponse, TokenOutcome};
use fanout_common::types::{Notification, Recipient};

/// Default upper bound for a single channel `send` call.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Error detail recorded for a requested token the channel said nothing about.
pub const MISSING_OUTCOME: &str = "no outcome reported by channel";

/// Payload key carrying the source notification id.
pub const NOTIFICATION_ID_KEY: &str = "notId";

/// Normalized result of one channel dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelResult {
    /// Transport name reported by the sender (e.g. `apn`, `gcm`).
    pub method: String,
    /// Platform tag of the dispatched group.
    pub device: String,
    pub success: u32,
    pub failure: u32,
    pub message: Vec<TokenOutcome>,
}

/// Failure of a dispatch as a whole. Records of the group stay pending.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("channel send timed out after {0:?}")]
    Timeout(Duration),

    #[error("no channel sender registered for platform '{0}'")]
    NoSender(String),
}

/// Registry of platform tag → channel sender.
#[derive(Clone)]
pub struct ChannelDispatcher {
    senders: HashMap<String, Arc<dyn ChannelSender>>,
    send_timeout: Duration,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Register `sender` for `platform`, replacing any previous one.
    pub fn with_sender(mut self, platform: impl Into<String>, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(platform, sender);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn register(&mut self, platform: impl Into<String>, sender: Arc<dyn ChannelSender>) {
        let platform = platform.into();
        tracing::debug!(platform = %platform, method = sender.method(), "Channel sender registered");
        self.senders.insert(platform, sender);
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }

    /// Build the single request sent for `recipients`.
    pub fn build_request(notification: &Notification, recipients: &[&Recipient]) -> PushRequest {
        PushRequest {
            message: notification.title.clone(),
            payload: merge_payload(&notification.data, notification),
            tokens: collect_tokens(recipients),
            badge: notification.badge,
            sound: notification.sound.clone(),
        }
    }

    /// Send `notification` to the `device` group and normalize the outcome.
    pub async fn dispatch(
        &self,
        device: &str,
        notification: &Notification,
        recipients: &[&Recipient],
    ) -> Result<ChannelResult, DispatchError> {
        let sender = self
            .senders
            .get(device)
            .ok_or_else(|| DispatchError::NoSender(device.to_string()))?;

        let request = Self::build_request(notification, recipients);
        if request.tokens.is_empty() {
            return Ok(ChannelResult {
                method: sender.method().to_string(),
                device: device.to_string(),
                success: 0,
                failure: 0,
                message: Vec::new(),
            });
        }

        let response = tokio::time::timeout(self.send_timeout, sender.send(&request))
            .await
            .map_err(|_| DispatchError::Timeout(self.send_timeout))??;

        let message = normalize(&request.tokens, response);
        let success = message.iter().filter(|o| o.is_success()).count() as u32;
        let failure = message.len() as u32 - success;

        tracing::info!(
            notification_id = %notification.id,
            device,
            method = sender.method(),
            success,
            failure,
            "Channel dispatch completed"
        );

        Ok(ChannelResult {
            method: sender.method().to_string(),
            device: device.to_string(),
            success,
            failure,
            message,
        })
    }

    /// Dispatch every group concurrently. Results come back sorted by
    /// platform tag, one entry per group.
    pub async fn send(
        &self,
        notification: &Notification,
        groups: &HashMap<&str, Vec<&Recipient>>,
    ) -> Vec<(String, Result<ChannelResult, DispatchError>)> {
        let mut devices: Vec<&str> = groups.keys().copied().collect();
        devices.sort_unstable();

        let dispatches = devices.into_iter().map(|device| async move {
            let result = self.dispatch(device, notification, &groups[device]).await;
            (device.to_string(), result)
        });

        join_all(dispatches).await
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Device tokens of `recipients`, skipping absent or blank ones.
pub fn collect_tokens(recipients: &[&Recipient]) -> Vec<String> {
    recipients
        .iter()
        .filter_map(|r| r.device_token.as_deref())
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Align a channel response with the requested tokens.
///
/// Every requested token appears once, in request order. The first report
/// for a token wins; tokens never reported get `MISSING_OUTCOME`; reports
/// for tokens that were not requested are dropped.
pub fn normalize(tokens: &[String], response: PushResponse) -> Vec<TokenOutcome> {
    let mut reported: HashMap<String, Option<String>> = HashMap::with_capacity(response.message.len());
    for outcome in response.message {
        reported.entry(outcome.token).or_insert(outcome.error);
    }

    let mut seen: HashSet<&String> = HashSet::with_capacity(tokens.len());
    tokens
        .iter()
        .filter(|t| seen.insert(*t))
        .map(|token| match reported.get(token) {
            Some(error) => TokenOutcome {
                token: token.clone(),
                error: error.clone(),
            },
            None => TokenOutcome::failed(token.clone(), MISSING_OUTCOME),
        })
        .collect()
}

/// Channel payload: the notification data with its id merged in.
fn merge_payload(data: &serde_json::Value, notification: &Notification) -> serde_json::Value {
    let mut payload = match data {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    payload.insert(
        NOTIFICATION_ID_KEY.to_string(),
        serde_json::Value::String(notification.id.to_string()),
    );
    serde_json::Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use fanout_common::types::NewNotification;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Reports every token as delivered and remembers the requests.
    #[derive(Default)]
    struct Recording {
        requests: Mutex<Vec<PushRequest>>,
    }

    #[async_trait]
    impl ChannelSender for Recording {
        fn method(&self) -> &'static str {
            "rec"
        }

        async fn send(&self, request: &PushRequest) -> Result<PushResponse, ChannelError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(PushResponse::from_outcomes(
                request.tokens.iter().map(TokenOutcome::delivered).collect(),
            ))
        }
    }

    struct Stuck;

    #[async_trait]
    impl ChannelSender for Stuck {
        fn method(&self) -> &'static str {
            "stuck"
        }

        async fn send(&self, _request: &PushRequest) -> Result<PushResponse, ChannelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(PushResponse::default())
        }
    }

    struct Broken;

    #[async_trait]
    impl ChannelSender for Broken {
        fn method(&self) -> &'static str {
            "broken"
        }

        async fn send(&self, _request: &PushRequest) -> Result<PushResponse, ChannelError> {
            Err(ChannelError::Transport("connection refused".to_string()))
        }
    }

    fn recipient(device: &str, token: Option<&str>) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            email: None,
            name: None,
            device: Some(device.to_string()),
            device_token: token.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    fn notification(data: serde_json::Value) -> Notification {
        NewNotification {
            badge: Some(3),
            sound: Some("mySound2".to_string()),
            data: Some(data),
            ..NewNotification::titled("test notification 101")
        }
        .build()
    }

    #[test]
    fn test_build_request_merges_notification_id() {
        let n = notification(serde_json::json!({"type": "new-message", "messageId": 2}));
        let a = recipient("ios", Some("ios1"));
        let b = recipient("ios", None);
        let request = ChannelDispatcher::build_request(&n, &[&a, &b]);

        assert_eq!(request.message, "test notification 101");
        assert_eq!(request.tokens, vec!["ios1"]);
        assert_eq!(request.badge, 3);
        assert_eq!(request.sound, "mySound2");
        assert_eq!(request.payload["type"], "new-message");
        assert_eq!(request.payload["messageId"], 2);
        assert_eq!(request.payload[NOTIFICATION_ID_KEY], n.id.to_string());
    }

    #[test]
    fn test_build_request_wraps_scalar_data() {
        let n = notification(serde_json::json!("hello"));
        let request = ChannelDispatcher::build_request(&n, &[]);
        assert_eq!(request.payload["value"], "hello");
        assert!(request.payload.get(NOTIFICATION_ID_KEY).is_some());
    }

    #[test]
    fn test_normalize_covers_each_token_once() {
        let tokens: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        let response = PushResponse::from_outcomes(vec![
            TokenOutcome::failed("b", "Unregistered"),
            TokenOutcome::delivered("a"),
            TokenOutcome::delivered("b"),
            TokenOutcome::delivered("zzz"),
        ]);

        let outcomes = normalize(&tokens, response);

        assert_eq!(
            outcomes,
            vec![
                TokenOutcome::delivered("a"),
                TokenOutcome::failed("b", "Unregistered"),
                TokenOutcome::failed("c", MISSING_OUTCOME),
            ]
        );
    }

    #[test]
    fn test_collect_tokens_skips_missing_and_blank() {
        let rs = [
            recipient("ios", Some("ios1")),
            recipient("ios", None),
            recipient("ios", Some("  ")),
            recipient("ios", Some("ios2")),
        ];
        let refs: Vec<&Recipient> = rs.iter().collect();
        assert_eq!(collect_tokens(&refs), vec!["ios1".to_string(), "ios2".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_calls_sender_once() {
        let sender = Arc::new(Recording::default());
        let dispatcher = ChannelDispatcher::new().with_sender("ios", sender.clone());
        let n = notification(serde_json::json!({}));
        let rs = [recipient("ios", Some("ios1")), recipient("ios", Some("ios2"))];
        let refs: Vec<&Recipient> = rs.iter().collect();

        let result = dispatcher.dispatch("ios", &n, &refs).await.unwrap();

        assert_eq!(result.method, "rec");
        assert_eq!(result.device, "ios");
        assert_eq!(result.success, 2);
        assert_eq!(result.failure, 0);
        assert_eq!(result.message.len(), 2);
        assert_eq!(sender.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_tokens_skips_sender() {
        let sender = Arc::new(Recording::default());
        let dispatcher = ChannelDispatcher::new().with_sender("ios", sender.clone());
        let n = notification(serde_json::json!({}));
        let r = recipient("ios", None);

        let result = dispatcher.dispatch("ios", &n, &[&r]).await.unwrap();

        assert!(result.message.is_empty());
        assert!(sender.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let dispatcher = ChannelDispatcher::new()
            .with_sender("ios", Arc::new(Stuck))
            .with_send_timeout(Duration::from_secs(5));
        let n = notification(serde_json::json!({}));
        let r = recipient("ios", Some("ios1"));

        let result = dispatcher.dispatch("ios", &n, &[&r]).await;

        assert!(matches!(result, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_send_reports_each_group() {
        let dispatcher = ChannelDispatcher::new()
            .with_sender("ios", Arc::new(Recording::default()))
            .with_sender("android", Arc::new(Broken));
        let n = notification(serde_json::json!({}));
        let rs = [
            recipient("ios", Some("ios1")),
            recipient("android", Some("android1")),
            recipient("web", Some("web1")),
        ];
        let groups = crate::grouping::group_by_device(&rs);

        let results = dispatcher.send(&n, &groups).await;

        let devices: Vec<&str> = results.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(devices, vec!["android", "ios", "web"]);
        assert!(matches!(results[0].1, Err(DispatchError::Channel(_))));
        assert_eq!(results[1].1.as_ref().unwrap().success, 1);
        assert!(matches!(results[2].1, Err(DispatchError::NoSender(_))));
    }
}
