use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known device platform tags.
///
/// Tags are open strings so a new channel only needs a sender registered
/// under its tag.
pub mod platform {
    pub const IOS: &str = "ios";
    pub const ANDROID: &str = "android";
}

/// Default badge count for a new notification.
pub const DEFAULT_BADGE: i32 = 1;

/// Default sound identifier for a new notification.
pub const DEFAULT_SOUND: &str = "default";

/// Scheduling state. Persisted only; nothing here acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Waiting,
    Finished,
}

/// Per-recipient delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Error,
}

impl DeliveryStatus {
    /// `success` and `error` are terminal; a record never leaves them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// The message-of-record, created once and fanned out to an audience.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub body: Option<String>,
    /// Owning profile, if any.
    pub profile_id: Option<Uuid>,
    /// Restricts the audience; empty means every device-bearing recipient.
    pub participants: Vec<Uuid>,
    pub is_scheduled: bool,
    pub schedule_status: Option<ScheduleStatus>,
    pub activated_at: Option<DateTime<Utc>>,
    pub badge: i32,
    pub sound: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a notification. Omitted fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewNotification {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub profile_id: Option<Uuid>,
    #[serde(default)]
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default)]
    pub schedule_status: Option<ScheduleStatus>,
    #[serde(default)]
    pub badge: Option<i32>,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl NewNotification {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Materialize a notification with a fresh id, timestamps and defaults
    /// for every omitted field.
    pub fn build(&self) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            title: self.title.clone(),
            body: self.body.clone(),
            profile_id: self.profile_id,
            participants: self.participants.clone(),
            is_scheduled: self.is_scheduled,
            schedule_status: self.schedule_status,
            activated_at: None,
            badge: self.badge.unwrap_or(DEFAULT_BADGE),
            sound: self.sound.clone().unwrap_or_else(|| DEFAULT_SOUND.to_string()),
            data: self.data.clone().unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        }
    }
}

impl NotificationUpdate {
    /// Merge the set fields into `notification` and bump `updated_at`.
    pub fn apply(&self, notification: &mut Notification) {
        if let Some(title) = &self.title {
            notification.title = title.clone();
        }
        if let Some(body) = &self.body {
            notification.body = Some(body.clone());
        }
        if let Some(badge) = self.badge {
            notification.badge = badge;
        }
        if let Some(sound) = &self.sound {
            notification.sound = sound.clone();
        }
        if let Some(data) = &self.data {
            notification.data = data.clone();
        }
        if let Some(is_scheduled) = self.is_scheduled {
            notification.is_scheduled = is_scheduled;
        }
        if let Some(status) = self.schedule_status {
            notification.schedule_status = Some(status);
        }
        if let Some(at) = self.activated_at {
            notification.activated_at = Some(at);
        }
        notification.updated_at = Utc::now();
    }
}

/// Partial update of an existing notification. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub badge: Option<i32>,
    pub sound: Option<String>,
    pub data: Option<serde_json::Value>,
    pub is_scheduled: Option<bool>,
    pub schedule_status: Option<ScheduleStatus>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// An addressable push target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
    /// Device platform tag, e.g. `ios` or `android`.
    pub device: Option<String>,
    pub device_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for `RecipientStore::find_or_create`, keyed by email.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRecipient {
    pub email: String,
    pub name: Option<String>,
    pub device: Option<String>,
    pub device_token: Option<String>,
}

/// Delivery state of one notification for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub recipient_id: Uuid,
    /// Device token as it was when the record was created.
    pub token: Option<String>,
    pub status: DeliveryStatus,
    /// Provider error, present only when `status` is `error`.
    pub error_detail: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Build a pending record for `recipient`, snapshotting its token.
    pub fn pending(notification_id: Uuid, recipient: &Recipient) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            notification_id,
            recipient_id: recipient.id,
            token: recipient.device_token.clone(),
            status: DeliveryStatus::Pending,
            error_detail: None,
            activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal status written to a pending delivery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPatch {
    Success,
    Error(String),
}

impl DeliveryPatch {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            DeliveryPatch::Success => DeliveryStatus::Success,
            DeliveryPatch::Error(_) => DeliveryStatus::Error,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match self {
            DeliveryPatch::Success => None,
            DeliveryPatch::Error(detail) => Some(detail),
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleStatus::Waiting => write!(f, "waiting"),
            ScheduleStatus::Finished => write!(f, "finished"),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Success => write!(f, "success"),
            DeliveryStatus::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(token: Option<&str>) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            email: None,
            name: None,
            device: Some(platform::IOS.to_string()),
            device_token: token.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pending_record_snapshots_token() {
        let notification_id = Uuid::new_v4();
        let mut r = recipient(Some("ios1"));
        let record = DeliveryRecord::pending(notification_id, &r);
        r.device_token = Some("rotated".to_string());

        assert_eq!(record.notification_id, notification_id);
        assert_eq!(record.recipient_id, r.id);
        assert_eq!(record.token.as_deref(), Some("ios1"));
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert!(record.error_detail.is_none());
    }

    #[test]
    fn test_build_applies_defaults() {
        let n = NewNotification::titled("test notification").build();
        assert_eq!(n.title, "test notification");
        assert!(!n.is_scheduled);
        assert!(n.participants.is_empty());
        assert_eq!(n.badge, 1);
        assert_eq!(n.sound, "default");
        assert_eq!(n.data, serde_json::json!({}));
    }

    #[test]
    fn test_build_keeps_supplied_fields() {
        let n = NewNotification {
            badge: Some(2),
            sound: Some("mySound".to_string()),
            data: Some(serde_json::json!({"type": "new-message", "messageId": 1})),
            ..NewNotification::titled("test notification")
        }
        .build();
        assert_eq!(n.badge, 2);
        assert_eq!(n.sound, "mySound");
        assert_eq!(n.data["messageId"], 1);
    }

    #[test]
    fn test_update_apply_merges_set_fields() {
        let mut n = NewNotification::titled("before").build();
        let created = n.created_at;
        NotificationUpdate {
            title: Some("after".to_string()),
            schedule_status: Some(ScheduleStatus::Waiting),
            ..NotificationUpdate::default()
        }
        .apply(&mut n);

        assert_eq!(n.title, "after");
        assert_eq!(n.schedule_status, Some(ScheduleStatus::Waiting));
        assert_eq!(n.sound, "default");
        assert_eq!(n.created_at, created);
    }

    #[test]
    fn test_patch_status() {
        assert_eq!(DeliveryPatch::Success.status(), DeliveryStatus::Success);
        let err = DeliveryPatch::Error("BadDeviceToken".to_string());
        assert_eq!(err.status(), DeliveryStatus::Error);
        assert_eq!(err.error_detail(), Some("BadDeviceToken"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DeliveryStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
        assert_eq!(DeliveryStatus::Error.to_string(), "error");
    }
}
