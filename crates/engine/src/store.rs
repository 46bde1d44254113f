//! Persistence boundary for recipients, notifications and delivery records.
//!
//! The engine only talks to these traits. `PgStore` backs them with
//! PostgreSQL and `MemoryStore` keeps everything in process.

use async_trait::async_trait;
use uuid::Uuid;

use fanout_common::error::AppError;
use fanout_common::types::{
    DeliveryPatch, DeliveryRecord, NewNotification, NewRecipient, Notification,
    NotificationUpdate, Recipient,
};

/// Filter applied when paging through recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientQuery {
    /// Restrict to these recipient ids. `None` means no restriction.
    pub ids: Option<Vec<Uuid>>,
    /// Only recipients with a registered device platform.
    pub device_only: bool,
}

impl Default for RecipientQuery {
    fn default() -> Self {
        Self {
            ids: None,
            device_only: true,
        }
    }
}

impl RecipientQuery {
    /// Every device-bearing recipient.
    pub fn all() -> Self {
        Self::default()
    }

    /// Device-bearing recipients among `ids`. An empty list means no
    /// restriction.
    pub fn participants(ids: &[Uuid]) -> Self {
        Self {
            ids: (!ids.is_empty()).then(|| ids.to_vec()),
            device_only: true,
        }
    }

    pub fn include_deviceless(mut self) -> Self {
        self.device_only = false;
        self
    }

    /// Whether `recipient` passes this filter.
    pub fn matches(&self, recipient: &Recipient) -> bool {
        if self.device_only && recipient.device.is_none() {
            return false;
        }
        match &self.ids {
            Some(ids) => ids.contains(&recipient.id),
            None => true,
        }
    }
}

#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Fetch up to `limit` matching recipients with an id greater than
    /// `after`, ordered by id.
    async fn find_page(
        &self,
        query: &RecipientQuery,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Recipient>, AppError>;

    /// Number of recipients matching `query`.
    async fn count(&self, query: &RecipientQuery) -> Result<u64, AppError>;

    /// Return the recipient with `new.email`, creating it if absent.
    async fn find_or_create(&self, new: &NewRecipient) -> Result<Recipient, AppError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert all records or none of them.
    async fn create_many(&self, records: &[DeliveryRecord]) -> Result<Vec<DeliveryRecord>, AppError>;

    /// Apply `patch` to every still-pending record of `notification_id`
    /// carrying `token`. Returns the number of records changed.
    async fn update_pending(
        &self,
        notification_id: Uuid,
        token: &str,
        patch: &DeliveryPatch,
    ) -> Result<u64, AppError>;

    async fn list_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, AppError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError>;

    async fn update(&self, id: Uuid, patch: &NotificationUpdate) -> Result<Notification, AppError>;

    async fn get(&self, id: Uuid) -> Result<Notification, AppError>;
}
