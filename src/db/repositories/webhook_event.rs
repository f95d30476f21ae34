//! Processor webhook event log
//!
//! Claims an event id before processing so that redeliveries are
//! acknowledged without running the handlers twice.

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    /// Record an event id. Returns false if it was already recorded.
    async fn claim(&self, event_id: &str, event_type: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Forget an event so a redelivery is processed again
    async fn release(&self, event_id: &str) -> Result<()>;
}

pub struct SqlxWebhookEventRepository {
    pool: DynDatabasePool,
}

impl SqlxWebhookEventRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn WebhookEventRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl WebhookEventRepository for SqlxWebhookEventRepository {
    async fn claim(&self, event_id: &str, event_type: &str, now: DateTime<Utc>) -> Result<bool> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(
                "INSERT OR IGNORE INTO webhook_events (id, event_type, received_at) VALUES (?, ?, ?)",
            )
            .bind(event_id)
            .bind(event_type)
            .bind(now)
            .execute(self.pool.sqlite()?)
            .await
            .context("Failed to record webhook event")?
            .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(
                "INSERT IGNORE INTO webhook_events (id, event_type, received_at) VALUES (?, ?, ?)",
            )
            .bind(event_id)
            .bind(event_type)
            .bind(now)
            .execute(self.pool.mysql()?)
            .await
            .context("Failed to record webhook event")?
            .rows_affected(),
        };
        Ok(affected == 1)
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let sql = "DELETE FROM webhook_events WHERE id = ?";
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query(sql)
                    .bind(event_id)
                    .execute(self.pool.sqlite()?)
                    .await
                    .context("Failed to release webhook event")?;
            }
            DatabaseDriver::Mysql => {
                sqlx::query(sql)
                    .bind(event_id)
                    .execute(self.pool.mysql()?)
                    .await
                    .context("Failed to release webhook event")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_test_pool, migrations};

    #[tokio::test]
    async fn test_claim_once_and_release() {
        let pool = create_test_pool().await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        let repo = SqlxWebhookEventRepository::boxed(pool);
        let now = Utc::now();

        assert!(repo.claim("evt_1", "payment_intent.succeeded", now).await.unwrap());
        assert!(!repo.claim("evt_1", "payment_intent.succeeded", now).await.unwrap());

        repo.release("evt_1").await.unwrap();
        assert!(repo.claim("evt_1", "payment_intent.succeeded", now).await.unwrap());
    }
}
