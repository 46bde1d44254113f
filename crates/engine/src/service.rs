//! Notification service.
//!
//! Validated writes that feed the lifecycle hook.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use fanout_common::error::AppError;
use fanout_common::types::{NewNotification, Notification, NotificationUpdate};

use crate::hook::{FanoutHook, NotificationSaved};
use crate::orchestrator::RunSummary;
use crate::store::NotificationStore;

/// Per-call save options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Let the lifecycle hook start a fan-out for this save.
    pub hook_enabled: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self { hook_enabled: true }
    }
}

impl SaveOptions {
    /// Persist without triggering delivery (fixtures, admin corrections).
    pub fn quiet() -> Self {
        Self {
            hook_enabled: false,
        }
    }
}

/// A write together with the fan-out it started, if any.
#[derive(Debug)]
pub struct Saved {
    pub notification: Notification,
    pub fanout: Option<JoinHandle<RunSummary>>,
}

pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    hook: Option<FanoutHook>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store, hook: None }
    }

    pub fn with_hook(mut self, hook: FanoutHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Create a notification. Delivery, if triggered, runs in the background.
    pub async fn save(
        &self,
        data: &NewNotification,
        options: SaveOptions,
    ) -> Result<Notification, AppError> {
        Ok(self.save_tracked(data, options).await?.notification)
    }

    /// Like `save`, but hands back the spawned fan-out.
    pub async fn save_tracked(
        &self,
        data: &NewNotification,
        options: SaveOptions,
    ) -> Result<Saved, AppError> {
        Self::validate_title(&data.title)?;
        if let Some(badge) = data.badge {
            Self::validate_badge(badge)?;
        }

        let notification = self.store.insert(data).await?;
        tracing::info!(notification_id = %notification.id, "Notification created");

        let fanout = self.emit(NotificationSaved {
            notification: notification.clone(),
            first_persistence: true,
            hook_enabled: options.hook_enabled,
        });

        Ok(Saved {
            notification,
            fanout,
        })
    }

    /// Update an existing notification. Never triggers delivery.
    pub async fn update(
        &self,
        id: Uuid,
        patch: &NotificationUpdate,
        options: SaveOptions,
    ) -> Result<Saved, AppError> {
        if let Some(title) = &patch.title {
            Self::validate_title(title)?;
        }
        if let Some(badge) = patch.badge {
            Self::validate_badge(badge)?;
        }

        let notification = self.store.update(id, patch).await?;
        tracing::info!(notification_id = %id, "Notification updated");

        let fanout = self.emit(NotificationSaved {
            notification: notification.clone(),
            first_persistence: false,
            hook_enabled: options.hook_enabled,
        });

        Ok(Saved {
            notification,
            fanout,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Notification, AppError> {
        self.store.get(id).await
    }

    fn emit(&self, event: NotificationSaved) -> Option<JoinHandle<RunSummary>> {
        self.hook.as_ref().and_then(|hook| hook.on_saved(&event))
    }

    fn validate_title(title: &str) -> Result<(), AppError> {
        if title.trim().is_empty() {
            return Err(AppError::Validation(
                "Notification title is required".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_badge(badge: i32) -> Result<(), AppError> {
        if badge < 0 {
            return Err(AppError::Validation(format!(
                "Badge must not be negative, got {}",
                badge
            )));
        }
        Ok(())
    }
}
