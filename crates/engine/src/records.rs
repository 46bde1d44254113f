//! Delivery record writer.
//!
//! Records are bulk-created as `pending` before a batch is dispatched, then
//! moved to `success` or `error` once the channel reports back. Matching on
//! the way back is by (notification, token) because that is all a provider
//! response carries.
//!
//! Recipients without a device token get their record written as `error`
//! straight away since no channel can ever report on them.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use fanout_common::channel::TokenOutcome;
use fanout_common::error::AppError;
use fanout_common::types::{DeliveryPatch, DeliveryRecord, DeliveryStatus, Notification, Recipient};

use crate::store::DeliveryStore;

/// Error detail for records whose recipient has no device token.
pub const MISSING_TOKEN: &str = "missing device token";

/// Record updates in flight during one `reconcile`, kept below the pool size.
const RECONCILE_CONCURRENCY: usize = 8;

#[derive(Clone)]
pub struct DeliveryRecordWriter {
    store: Arc<dyn DeliveryStore>,
}

impl DeliveryRecordWriter {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }

    /// Create one pending record per recipient in a single bulk insert.
    ///
    /// Fails as a whole if the insert fails; no record of the batch exists
    /// afterwards.
    pub async fn create_records(
        &self,
        notification: &Notification,
        recipients: &[Recipient],
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records: Vec<DeliveryRecord> = recipients
            .iter()
            .map(|r| {
                let mut record = DeliveryRecord::pending(notification.id, r);
                if record.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
                    record.status = DeliveryStatus::Error;
                    record.error_detail = Some(MISSING_TOKEN.to_string());
                }
                record
            })
            .collect();

        let created = self.store.create_many(&records).await?;

        tracing::debug!(
            notification_id = %notification.id,
            count = created.len(),
            "Delivery records created"
        );

        Ok(created)
    }

    /// Move the pending records matching each outcome to its terminal status.
    ///
    /// Already-terminal records are left alone, so replaying the same outcomes
    /// changes nothing. Every outcome is attempted even when some updates
    /// fail; the first failure is returned after the rest have been written.
    /// Returns the number of records updated.
    pub async fn reconcile(
        &self,
        notification: &Notification,
        outcomes: &[TokenOutcome],
    ) -> Result<u64, AppError> {
        let notification_id = notification.id;
        let store = &self.store;

        let results: Vec<(String, Result<u64, AppError>)> = stream::iter(outcomes.iter().cloned())
            .map(|outcome| async move {
                let patch = match outcome.error {
                    None => DeliveryPatch::Success,
                    Some(detail) => DeliveryPatch::Error(detail),
                };
                let result = store
                    .update_pending(notification_id, &outcome.token, &patch)
                    .await;
                (outcome.token, result)
            })
            .buffer_unordered(RECONCILE_CONCURRENCY)
            .collect()
            .await;

        let mut updated = 0;
        let mut first_error = None;
        for (token, result) in results {
            match result {
                Ok(count) => updated += count,
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification_id,
                        token = %token,
                        error = %e,
                        "Delivery record update failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::debug!(
            notification_id = %notification_id,
            outcomes = outcomes.len(),
            updated,
            "Delivery records reconciled"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(updated),
        }
    }

    pub async fn records_for(
        &self,
        notification: &Notification,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        self.store.list_for_notification(notification.id).await
    }
}
