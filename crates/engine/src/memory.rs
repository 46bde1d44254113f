//! In-process stores.
//!
//! Recipients are kept in id order so keyset paging behaves exactly like the
//! Postgres store. All state sits behind one mutex that is never held across
//! an await point.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use fanout_common::error::AppError;
use fanout_common::types::{
    DeliveryPatch, DeliveryRecord, DeliveryStatus, NewNotification, NewRecipient, Notification,
    NotificationUpdate, Recipient,
};

use crate::store::{DeliveryStore, NotificationStore, RecipientQuery, RecipientStore};

#[derive(Default)]
struct State {
    recipients: BTreeMap<Uuid, Recipient>,
    notifications: HashMap<Uuid, Notification>,
    deliveries: Vec<DeliveryRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))
    }

    /// Insert or replace a recipient as-is.
    pub fn put_recipient(&self, recipient: Recipient) -> Result<(), AppError> {
        self.state()?.recipients.insert(recipient.id, recipient);
        Ok(())
    }

    /// Every delivery record, in insertion order.
    pub fn deliveries(&self) -> Result<Vec<DeliveryRecord>, AppError> {
        Ok(self.state()?.deliveries.clone())
    }
}

#[async_trait]
impl RecipientStore for MemoryStore {
    async fn find_page(
        &self,
        query: &RecipientQuery,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Recipient>, AppError> {
        let state = self.state()?;
        let page = state
            .recipients
            .values()
            .filter(|r| after.is_none_or(|after| r.id > after))
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    async fn count(&self, query: &RecipientQuery) -> Result<u64, AppError> {
        let state = self.state()?;
        Ok(state.recipients.values().filter(|r| query.matches(r)).count() as u64)
    }

    async fn find_or_create(&self, new: &NewRecipient) -> Result<Recipient, AppError> {
        let mut state = self.state()?;
        if let Some(existing) = state
            .recipients
            .values()
            .find(|r| r.email.as_deref() == Some(new.email.as_str()))
        {
            return Ok(existing.clone());
        }

        let recipient = Recipient {
            id: Uuid::new_v4(),
            email: Some(new.email.clone()),
            name: new.name.clone(),
            device: new.device.clone(),
            device_token: new.device_token.clone(),
            created_at: Utc::now(),
        };
        state.recipients.insert(recipient.id, recipient.clone());
        Ok(recipient)
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_many(&self, records: &[DeliveryRecord]) -> Result<Vec<DeliveryRecord>, AppError> {
        let mut state = self.state()?;
        // all-or-nothing: validate before touching the table
        let mut ids: HashSet<Uuid> = state.deliveries.iter().map(|d| d.id).collect();
        if let Some(dup) = records.iter().find(|r| !ids.insert(r.id)) {
            return Err(AppError::Validation(format!(
                "Delivery record {} already exists",
                dup.id
            )));
        }
        state.deliveries.extend_from_slice(records);
        Ok(records.to_vec())
    }

    async fn update_pending(
        &self,
        notification_id: Uuid,
        token: &str,
        patch: &DeliveryPatch,
    ) -> Result<u64, AppError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut updated = 0;
        for record in state.deliveries.iter_mut().filter(|d| {
            d.notification_id == notification_id
                && d.token.as_deref() == Some(token)
                && d.status == DeliveryStatus::Pending
        }) {
            record.status = patch.status();
            record.error_detail = patch.error_detail().map(str::to_string);
            record.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn list_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let state = self.state()?;
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.notification_id == notification_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let notification = new.build();
        self.state()?
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn update(&self, id: Uuid, patch: &NotificationUpdate) -> Result<Notification, AppError> {
        let mut state = self.state()?;
        let notification = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        patch.apply(notification);
        Ok(notification.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Notification, AppError> {
        self.state()?
            .notifications
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(store: &MemoryStore, n: usize, device: Option<&str>) -> Vec<Recipient> {
        let mut out = Vec::new();
        for i in 0..n {
            let r = store
                .find_or_create(&NewRecipient {
                    email: format!("{}-{}@example.org", device.unwrap_or("none"), i),
                    name: None,
                    device: device.map(str::to_string),
                    device_token: Some(format!("{}{}", device.unwrap_or("none"), i)),
                })
                .await
                .unwrap();
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_find_or_create_is_keyed_by_email() {
        let store = MemoryStore::new();
        let new = NewRecipient {
            email: "test1@example.org".to_string(),
            device: Some("ios".to_string()),
            ..NewRecipient::default()
        };
        let first = store.find_or_create(&new).await.unwrap();
        let second = store.find_or_create(&new).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.count(&RecipientQuery::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyset_paging_walks_every_recipient_once() {
        let store = MemoryStore::new();
        seed(&store, 5, Some("ios")).await;
        seed(&store, 2, None).await;

        let query = RecipientQuery::all();
        let mut after = None;
        let mut seen = Vec::new();
        loop {
            let page = store.find_page(&query, after, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|r| r.id);
            seen.extend(page.into_iter().map(|r| r.id));
        }

        assert_eq!(seen.len(), 5);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_update_pending_skips_terminal_records() {
        let store = MemoryStore::new();
        let recipients = seed(&store, 1, Some("ios")).await;
        let notification_id = Uuid::new_v4();
        store
            .create_many(&[DeliveryRecord::pending(notification_id, &recipients[0])])
            .await
            .unwrap();

        let first = store
            .update_pending(notification_id, "ios0", &DeliveryPatch::Success)
            .await
            .unwrap();
        let second = store
            .update_pending(
                notification_id,
                "ios0",
                &DeliveryPatch::Error("late".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        let records = store.list_for_notification(notification_id).await.unwrap();
        assert_eq!(records[0].status, DeliveryStatus::Success);
        assert!(records[0].error_detail.is_none());
    }

    #[tokio::test]
    async fn test_create_many_is_all_or_nothing() {
        let store = MemoryStore::new();
        let recipients = seed(&store, 2, Some("android")).await;
        let notification_id = Uuid::new_v4();
        let existing = DeliveryRecord::pending(notification_id, &recipients[0]);
        store.create_many(&[existing.clone()]).await.unwrap();

        let fresh = DeliveryRecord::pending(notification_id, &recipients[1]);
        let result = store.create_many(&[fresh, existing]).await;

        assert!(result.is_err());
        assert_eq!(store.deliveries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_many_rejects_duplicate_within_batch() {
        let store = MemoryStore::new();
        let recipients = seed(&store, 3, Some("ios")).await;
        let notification_id = Uuid::new_v4();
        let mut records: Vec<DeliveryRecord> = recipients
            .iter()
            .map(|r| DeliveryRecord::pending(notification_id, r))
            .collect();
        records.push(records[1].clone());

        let result = store.create_many(&records).await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(store.deliveries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_notification() {
        let store = MemoryStore::new();
        let result = store
            .update(Uuid::new_v4(), &NotificationUpdate::default())
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
