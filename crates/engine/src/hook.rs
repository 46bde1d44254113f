//! Lifecycle hook.
//!
//! Starts a fan-out when a notification is first persisted.

use std::sync::Arc;

use tokio::task::JoinHandle;

use fanout_common::types::Notification;

use crate::cursor::DEFAULT_BATCH_SIZE;
use crate::orchestrator::{FanoutOrchestrator, RunOptions, RunSummary};

/// Emitted by the notification service after every successful write.
#[derive(Debug, Clone)]
pub struct NotificationSaved {
    pub notification: Notification,
    /// `true` for the insert that created the notification, `false` for updates.
    pub first_persistence: bool,
    /// Caller opt-out; `false` suppresses the fan-out.
    pub hook_enabled: bool,
}

/// Spawns a detached fan-out run for newly created notifications.
#[derive(Clone)]
pub struct FanoutHook {
    orchestrator: Arc<FanoutOrchestrator>,
    batch_size: usize,
}

impl FanoutHook {
    pub fn new(orchestrator: Arc<FanoutOrchestrator>) -> Self {
        Self {
            orchestrator,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// React to a save. Returns the handle of the spawned run, or `None` when
    /// the event does not call for one. Dropping the handle detaches the run.
    pub fn on_saved(&self, event: &NotificationSaved) -> Option<JoinHandle<RunSummary>> {
        let notification_id = event.notification.id;

        if !event.first_persistence {
            tracing::debug!(notification_id = %notification_id, "Notification updated, no fan-out");
            return None;
        }
        if !event.hook_enabled {
            tracing::debug!(notification_id = %notification_id, "Fan-out suppressed by caller");
            return None;
        }

        let orchestrator = self.orchestrator.clone();
        let notification = event.notification.clone();
        let options = RunOptions::with_batch_size(self.batch_size);

        tracing::info!(notification_id = %notification_id, "Scheduling fan-out for new notification");
        Some(tokio::spawn(async move {
            orchestrator.run(&notification, options).await
        }))
    }
}
