//! Recipient cursor.
//!
//! Pull-driven batch retrieval.
//!
//! Each call to `next_batch` fetches one page from the store; nothing is read
//! ahead, so the consumer controls pacing and at most one batch is held in
//! memory. Paging is keyset-based (recipient id order), which means a failed
//! fetch can be retried from the same position.

use std::sync::Arc;

use futures::Stream;
use uuid::Uuid;

use fanout_common::error::AppError;
use fanout_common::types::Recipient;

use crate::store::{RecipientQuery, RecipientStore};

/// Default number of recipients per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// One page of recipients.
#[derive(Debug, Clone)]
pub struct RecipientBatch {
    pub recipients: Vec<Recipient>,
    /// Matching recipients when the cursor started.
    pub total: u64,
    /// Matching recipients not yet yielded, this batch excluded.
    pub remaining: u64,
}

/// Lazy, finite, non-restartable sequence of recipient batches.
pub struct RecipientCursor {
    store: Arc<dyn RecipientStore>,
    query: RecipientQuery,
    batch_size: usize,
    last_seen: Option<Uuid>,
    total: Option<u64>,
    yielded: u64,
    exhausted: bool,
}

impl RecipientCursor {
    pub fn new(
        store: Arc<dyn RecipientStore>,
        query: RecipientQuery,
        batch_size: usize,
    ) -> Result<Self, AppError> {
        if batch_size == 0 {
            return Err(AppError::Validation(
                "batch_size must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            store,
            query,
            batch_size,
            last_seen: None,
            total: None,
            yielded: 0,
            exhausted: false,
        })
    }

    pub fn query(&self) -> &RecipientQuery {
        &self.query
    }

    /// Fetch the next batch. Pulling is the advance signal.
    ///
    /// Returns `None` once the store has no more matching recipients. An
    /// error leaves the position unchanged; calling again retries it.
    pub async fn next_batch(&mut self) -> Option<Result<RecipientBatch, AppError>> {
        if self.exhausted {
            return None;
        }

        let total = match self.total {
            Some(total) => total,
            None => match self.store.count(&self.query).await {
                Ok(total) => {
                    self.total = Some(total);
                    total
                }
                Err(e) => return Some(Err(e)),
            },
        };

        let recipients = match self
            .store
            .find_page(&self.query, self.last_seen, self.batch_size)
            .await
        {
            Ok(page) => page,
            Err(e) => return Some(Err(e)),
        };

        if recipients.is_empty() {
            self.exhausted = true;
            return None;
        }

        // a short page means the store has nothing past it
        if recipients.len() < self.batch_size {
            self.exhausted = true;
        }

        self.last_seen = recipients.last().map(|r| r.id);
        self.yielded += recipients.len() as u64;

        Some(Ok(RecipientBatch {
            recipients,
            total,
            remaining: total.saturating_sub(self.yielded),
        }))
    }

    /// Adapt the cursor into a `Stream`. The stream ends after exhaustion or
    /// after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RecipientBatch, AppError>> {
        futures::stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next_batch().await? {
                Ok(batch) => Some((Ok(batch), Some(cursor))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
