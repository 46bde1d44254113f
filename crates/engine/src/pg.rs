//! PostgreSQL-backed stores.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use fanout_common::error::AppError;
use fanout_common::types::{
    DeliveryPatch, DeliveryRecord, NewNotification, NewRecipient, Notification,
    NotificationUpdate, Recipient,
};

use crate::store::{DeliveryStore, NotificationStore, RecipientQuery, RecipientStore};

/// Rows per multi-row INSERT, keeping bind parameters well under the
/// Postgres limit of 65535.
const INSERT_CHUNK: usize = 5_000;

/// Store implementation over a shared connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, query: &RecipientQuery) {
        qb.push(" WHERE TRUE");
        if query.device_only {
            qb.push(" AND device IS NOT NULL");
        }
        if let Some(ids) = &query.ids {
            qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
        }
    }
}

#[async_trait]
impl RecipientStore for PgStore {
    async fn find_page(
        &self,
        query: &RecipientQuery,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Recipient>, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM recipients");
        Self::push_filter(&mut qb, query);
        if let Some(after) = after {
            qb.push(" AND id > ").push_bind(after);
        }
        qb.push(" ORDER BY id LIMIT ").push_bind(limit as i64);

        let recipients = qb
            .build_query_as::<Recipient>()
            .fetch_all(&self.pool)
            .await?;
        Ok(recipients)
    }

    async fn count(&self, query: &RecipientQuery) -> Result<u64, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM recipients");
        Self::push_filter(&mut qb, query);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn find_or_create(&self, new: &NewRecipient) -> Result<Recipient, AppError> {
        sqlx::query(
            r#"
            INSERT INTO recipients (id, email, name, device, device_token)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.email)
        .bind(&new.name)
        .bind(&new.device)
        .bind(&new.device_token)
        .execute(&self.pool)
        .await?;

        let recipient: Recipient = sqlx::query_as("SELECT * FROM recipients WHERE email = $1")
            .bind(&new.email)
            .fetch_one(&self.pool)
            .await?;

        Ok(recipient)
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn create_many(&self, records: &[DeliveryRecord]) -> Result<Vec<DeliveryRecord>, AppError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(records.len());

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO delivery_records \
                 (id, notification_id, recipient_id, token, status, error_detail, activated_at, created_at, updated_at) ",
            );
            qb.push_values(chunk, |mut row, record| {
                row.push_bind(record.id)
                    .push_bind(record.notification_id)
                    .push_bind(record.recipient_id)
                    .push_bind(record.token.clone())
                    .push_bind(record.status.to_string())
                    .push_bind(record.error_detail.clone())
                    .push_bind(record.activated_at)
                    .push_bind(record.created_at)
                    .push_bind(record.updated_at);
            });
            qb.push(" RETURNING *");

            let rows: Vec<DeliveryRecord> = qb.build_query_as().fetch_all(&mut *tx).await?;
            stored.extend(rows);
        }

        tx.commit().await?;

        tracing::debug!(count = stored.len(), "Delivery records inserted");
        Ok(stored)
    }

    async fn update_pending(
        &self,
        notification_id: Uuid,
        token: &str,
        patch: &DeliveryPatch,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = $1, error_detail = $2, updated_at = NOW()
            WHERE notification_id = $3 AND token = $4 AND status = 'pending'
            "#,
        )
        .bind(patch.status().to_string())
        .bind(patch.error_detail())
        .bind(notification_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records: Vec<DeliveryRecord> = sqlx::query_as(
            "SELECT * FROM delivery_records WHERE notification_id = $1 ORDER BY created_at, id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let n = new.build();

        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (id, title, body, profile_id, participants, is_scheduled, schedule_status,
                 activated_at, badge, sound, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(n.id)
        .bind(&n.title)
        .bind(&n.body)
        .bind(n.profile_id)
        .bind(&n.participants)
        .bind(n.is_scheduled)
        .bind(n.schedule_status.map(|s| s.to_string()))
        .bind(n.activated_at)
        .bind(n.badge)
        .bind(&n.sound)
        .bind(&n.data)
        .bind(n.created_at)
        .bind(n.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn update(&self, id: Uuid, patch: &NotificationUpdate) -> Result<Notification, AppError> {
        let mut n = self.get(id).await?;
        patch.apply(&mut n);

        let notification: Notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET title = $1, body = $2, badge = $3, sound = $4, data = $5,
                is_scheduled = $6, schedule_status = $7, activated_at = $8, updated_at = $9
            WHERE id = $10
            RETURNING *
            "#,
        )
        .bind(&n.title)
        .bind(&n.body)
        .bind(n.badge)
        .bind(&n.sound)
        .bind(&n.data)
        .bind(n.is_scheduled)
        .bind(n.schedule_status.map(|s| s.to_string()))
        .bind(n.activated_at)
        .bind(n.updated_at)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn get(&self, id: Uuid) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        Ok(notification)
    }
}
