//! Fan-out orchestrator.
//!
//! Drives one notification through its audience, batch by batch:
//! 1. Pull the next batch from the recipient cursor
//! 2. Bulk-create pending delivery records for the batch
//! 3. Group the batch by device platform
//! 4. Dispatch every group concurrently, reconciling each group's outcomes as
//!    soon as its channel answers
//! 5. Count the batch and pull the next one
//!
//! Batches are strictly sequential, so memory is bounded by one batch. Batch
//! level failures are logged and skipped; a run never fails once started.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use fanout_common::channel::ChannelSender;
use fanout_common::error::AppError;
use fanout_common::types::{Notification, Recipient};

use crate::cursor::{DEFAULT_BATCH_SIZE, RecipientCursor};
use crate::dispatcher::ChannelDispatcher;
use crate::grouping::group_by_device;
use crate::records::DeliveryRecordWriter;
use crate::store::{DeliveryStore, RecipientQuery, RecipientStore};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Streaming,
    BatchProcessing,
    Done,
    /// Stopped before the cursor was exhausted (fetch error or unusable options).
    Aborted,
}

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Audience restriction. `None` uses the notification's own participants;
    /// an empty list means every device-bearing recipient.
    pub participants: Option<Vec<Uuid>>,
    pub batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            participants: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RunOptions {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Batches pulled from the cursor, including ones whose processing failed.
    pub batches: u64,
    pub records_created: u64,
    /// Tokens the channels reported as delivered.
    pub succeeded: u64,
    /// Tokens the channels reported as failed.
    pub failed: u64,
    pub state: RunState,
}

#[derive(Debug, Default)]
struct BatchStats {
    records_created: u64,
    succeeded: u64,
    failed: u64,
}

/// Top-level fan-out driver. Cheap to share behind an `Arc`.
pub struct FanoutOrchestrator {
    recipients: Arc<dyn RecipientStore>,
    writer: DeliveryRecordWriter,
    dispatcher: ChannelDispatcher,
}

impl FanoutOrchestrator {
    pub fn builder() -> FanoutOrchestratorBuilder {
        FanoutOrchestratorBuilder::default()
    }

    pub fn writer(&self) -> &DeliveryRecordWriter {
        &self.writer
    }

    pub fn dispatcher(&self) -> &ChannelDispatcher {
        &self.dispatcher
    }

    /// Open a cursor over the recipients matching `query`.
    pub fn find_recipients(
        &self,
        query: RecipientQuery,
        batch_size: usize,
    ) -> Result<RecipientCursor, AppError> {
        RecipientCursor::new(self.recipients.clone(), query, batch_size)
    }

    /// Fan `notification` out to its own participants (or everyone).
    pub async fn save_trigger(
        &self,
        notification: &Notification,
        batch_size: Option<usize>,
    ) -> RunSummary {
        let options = RunOptions::with_batch_size(batch_size.unwrap_or(DEFAULT_BATCH_SIZE));
        self.run(notification, options).await
    }

    /// Fan `notification` out. Always resolves; failures are logged.
    #[tracing::instrument(skip_all, fields(notification_id = %notification.id))]
    pub async fn run(&self, notification: &Notification, options: RunOptions) -> RunSummary {
        let mut summary = RunSummary::default();

        let participants = options
            .participants
            .as_deref()
            .unwrap_or(notification.participants.as_slice());
        let query = RecipientQuery::participants(participants);

        let mut cursor = match self.find_recipients(query, options.batch_size) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::error!(error = %e, "Cannot open recipient cursor, fan-out aborted");
                summary.state = RunState::Aborted;
                return summary;
            }
        };

        tracing::info!(
            batch_size = options.batch_size,
            participants = participants.len(),
            "Fan-out started"
        );

        loop {
            summary.state = RunState::Streaming;
            let batch = match cursor.next_batch().await {
                None => break,
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    tracing::error!(
                        batch = summary.batches + 1,
                        error = %e,
                        "Recipient fetch failed, stopping fan-out"
                    );
                    summary.state = RunState::Aborted;
                    return summary;
                }
            };

            summary.state = RunState::BatchProcessing;
            summary.batches += 1;
            tracing::debug!(
                batch = summary.batches,
                size = batch.recipients.len(),
                remaining = batch.remaining,
                "Processing batch"
            );

            let stats = self
                .process_batch(notification, summary.batches, &batch.recipients)
                .await;
            summary.records_created += stats.records_created;
            summary.succeeded += stats.succeeded;
            summary.failed += stats.failed;
        }

        summary.state = RunState::Done;
        tracing::info!(
            batches = summary.batches,
            records = summary.records_created,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Fan-out finished"
        );
        summary
    }

    async fn process_batch(
        &self,
        notification: &Notification,
        batch: u64,
        recipients: &[Recipient],
    ) -> BatchStats {
        let mut stats = BatchStats::default();

        match self.writer.create_records(notification, recipients).await {
            Ok(created) => stats.records_created = created.len() as u64,
            Err(e) => {
                tracing::warn!(batch, error = %e, "Delivery record creation failed, batch skipped");
                return stats;
            }
        }

        let groups = group_by_device(recipients);
        let mut devices: Vec<&str> = groups.keys().copied().collect();
        devices.sort_unstable();

        let channels = devices.into_iter().map(|device| {
            let group = &groups[device];
            async move {
                let result = match self.dispatcher.dispatch(device, notification, group).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(
                            batch,
                            device,
                            recipients = group.len(),
                            error = %e,
                            "Channel dispatch failed, records left pending"
                        );
                        return (0, 0);
                    }
                };

                if let Err(e) = self.writer.reconcile(notification, &result.message).await {
                    tracing::warn!(batch, device, error = %e, "Delivery reconciliation failed");
                }
                (result.success as u64, result.failure as u64)
            }
        });

        for (succeeded, failed) in join_all(channels).await {
            stats.succeeded += succeeded;
            stats.failed += failed;
        }
        stats
    }
}

/// Builder wiring the orchestrator's collaborators.
#[derive(Default)]
pub struct FanoutOrchestratorBuilder {
    recipients: Option<Arc<dyn RecipientStore>>,
    deliveries: Option<Arc<dyn DeliveryStore>>,
    dispatcher: ChannelDispatcher,
}

impl FanoutOrchestratorBuilder {
    pub fn recipient_store(mut self, store: Arc<dyn RecipientStore>) -> Self {
        self.recipients = Some(store);
        self
    }

    pub fn delivery_store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.deliveries = Some(store);
        self
    }

    /// Register the channel sender for a platform tag.
    pub fn sender(mut self, platform: impl Into<String>, sender: Arc<dyn ChannelSender>) -> Self {
        self.dispatcher.register(platform, sender);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_send_timeout(timeout);
        self
    }

    pub fn build(self) -> Result<FanoutOrchestrator, AppError> {
        let recipients = self
            .recipients
            .ok_or_else(|| AppError::Config("recipient store is required".to_string()))?;
        let deliveries = self
            .deliveries
            .ok_or_else(|| AppError::Config("delivery record store is required".to_string()))?;
        if self.dispatcher.is_empty() {
            return Err(AppError::Config(
                "at least one channel sender must be registered".to_string(),
            ));
        }

        Ok(FanoutOrchestrator {
            recipients,
            writer: DeliveryRecordWriter::new(deliveries),
            dispatcher: self.dispatcher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use fanout_common::channel::{ChannelError, PushRequest, PushResponse, TokenOutcome};

    struct AllDelivered;

    #[async_trait]
    impl ChannelSender for AllDelivered {
        fn method(&self) -> &'static str {
            "ok"
        }

        async fn send(&self, request: &PushRequest) -> Result<PushResponse, ChannelError> {
            Ok(PushResponse::from_outcomes(
                request.tokens.iter().map(TokenOutcome::delivered).collect(),
            ))
        }
    }

    #[test]
    fn test_build_requires_recipient_store() {
        let result = FanoutOrchestrator::builder()
            .delivery_store(Arc::new(MemoryStore::new()))
            .sender("ios", Arc::new(AllDelivered))
            .build();
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_build_requires_delivery_store() {
        let result = FanoutOrchestrator::builder()
            .recipient_store(Arc::new(MemoryStore::new()))
            .sender("ios", Arc::new(AllDelivered))
            .build();
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_build_requires_a_sender() {
        let store = Arc::new(MemoryStore::new());
        let result = FanoutOrchestrator::builder()
            .recipient_store(store.clone())
            .delivery_store(store)
            .build();
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_batch_size_aborts_without_failing() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = FanoutOrchestrator::builder()
            .recipient_store(store.clone())
            .delivery_store(store)
            .sender("ios", Arc::new(AllDelivered))
            .build()
            .unwrap();
        let notification = fanout_common::types::NewNotification::titled("t").build();

        let summary = orchestrator
            .run(&notification, RunOptions::with_batch_size(0))
            .await;

        assert_eq!(summary.batches, 0);
        assert_eq!(summary.state, RunState::Aborted);
    }

    #[tokio::test]
    async fn test_empty_audience_is_done_with_zero_batches() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = FanoutOrchestrator::builder()
            .recipient_store(store.clone())
            .delivery_store(store)
            .sender("ios", Arc::new(AllDelivered))
            .build()
            .unwrap();
        let notification = fanout_common::types::NewNotification::titled("t").build();

        let summary = orchestrator.run(&notification, RunOptions::default()).await;

        assert_eq!(summary.batches, 0);
        assert_eq!(summary.state, RunState::Done);
    }
}
