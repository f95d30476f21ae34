//! Pending transfer repository
//!
//! One row per session (unique `session_id`). Status changes are
//! conditional on the current status so that concurrent executions of the
//! same payout cannot both record success.

use crate::config::DatabaseDriver;
use crate::db::{is_unique_violation, DynDatabasePool};
use crate::models::{Cents, PendingTransfer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

const TRANSFER_COLUMNS: &str = "id, session_id, tutor_id, student_id, amount, platform_fee, \
    processor_fee, status, payment_transaction_id, transfer_id, failure_reason, created_at, updated_at";

#[async_trait]
pub trait PendingTransferRepository: Send + Sync {
    /// Insert a payout row. Returns false if the session already has one.
    async fn create(&self, transfer: &PendingTransfer) -> Result<bool>;

    async fn get_by_id(&self, id: &str) -> Result<Option<PendingTransfer>>;

    async fn get_by_session(&self, session_id: &str) -> Result<Option<PendingTransfer>>;

    /// `pending` rows for a tutor, oldest first
    async fn list_pending_for_tutor(&self, tutor_id: &str) -> Result<Vec<PendingTransfer>>;

    /// `pending -> completed`
    async fn mark_completed(&self, id: &str, transfer_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `pending -> failed`, keeping the processor's reason
    async fn mark_failed(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `failed -> pending` for an operator retry
    async fn reset_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;
}

pub struct SqlxPendingTransferRepository {
    pool: DynDatabasePool,
}

impl SqlxPendingTransferRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn PendingTransferRepository> {
        Arc::new(Self::new(pool))
    }

    async fn fetch_where(&self, condition: &str, value: &str) -> Result<Vec<PendingTransfer>> {
        let sql = format!(
            "SELECT {} FROM pending_transfers WHERE {} ORDER BY created_at, id",
            TRANSFER_COLUMNS, condition
        );
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = sqlx::query(&sql)
                    .bind(value)
                    .fetch_all(self.pool.sqlite()?)
                    .await
                    .context("Failed to query pending transfers")?;
                rows.iter().map(row_to_transfer_sqlite).collect()
            }
            DatabaseDriver::Mysql => {
                let rows = sqlx::query(&sql)
                    .bind(value)
                    .fetch_all(self.pool.mysql()?)
                    .await
                    .context("Failed to query pending transfers")?;
                rows.iter().map(row_to_transfer_mysql).collect()
            }
        }
    }

    async fn update(&self, sql: &str, first: &str, now: DateTime<Utc>, id: &str) -> Result<bool> {
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(first)
                .bind(now)
                .bind(id)
                .execute(self.pool.sqlite()?)
                .await
                .context("Failed to update pending transfer")?
                .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(first)
                .bind(now)
                .bind(id)
                .execute(self.pool.mysql()?)
                .await
                .context("Failed to update pending transfer")?
                .rows_affected(),
        };
        Ok(affected == 1)
    }
}

#[async_trait]
impl PendingTransferRepository for SqlxPendingTransferRepository {
    async fn create(&self, transfer: &PendingTransfer) -> Result<bool> {
        let result = match self.pool.driver() {
            DatabaseDriver::Sqlite => create_sqlite(self.pool.sqlite()?, transfer).await,
            DatabaseDriver::Mysql => create_mysql(self.pool.mysql()?, transfer).await,
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<PendingTransfer>> {
        Ok(self.fetch_where("id = ?", id).await?.into_iter().next())
    }

    async fn get_by_session(&self, session_id: &str) -> Result<Option<PendingTransfer>> {
        Ok(self.fetch_where("session_id = ?", session_id).await?.into_iter().next())
    }

    async fn list_pending_for_tutor(&self, tutor_id: &str) -> Result<Vec<PendingTransfer>> {
        self.fetch_where("tutor_id = ? AND status = 'pending'", tutor_id).await
    }

    async fn mark_completed(&self, id: &str, transfer_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update(
            "UPDATE pending_transfers SET status = 'completed', transfer_id = ?, failure_reason = NULL, \
             updated_at = ? WHERE id = ? AND status = 'pending'",
            transfer_id,
            now,
            id,
        )
        .await
    }

    async fn mark_failed(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update(
            "UPDATE pending_transfers SET status = 'failed', failure_reason = ?, \
             updated_at = ? WHERE id = ? AND status = 'pending'",
            reason,
            now,
            id,
        )
        .await
    }

    async fn reset_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        // failure_reason is kept until the next attempt overwrites or clears it
        let sql = "UPDATE pending_transfers SET status = 'pending', updated_at = ? \
                   WHERE id = ? AND status = 'failed'";
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(now)
                .bind(id)
                .execute(self.pool.sqlite()?)
                .await
                .context("Failed to reset pending transfer")?
                .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(now)
                .bind(id)
                .execute(self.pool.mysql()?)
                .await
                .context("Failed to reset pending transfer")?
                .rows_affected(),
        };
        Ok(affected == 1)
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_sqlite(pool: &SqlitePool, t: &PendingTransfer) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO pending_transfers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        TRANSFER_COLUMNS
    ))
    .bind(&t.id)
    .bind(&t.session_id)
    .bind(&t.tutor_id)
    .bind(&t.student_id)
    .bind(t.amount.get())
    .bind(t.platform_fee.get())
    .bind(t.processor_fee.get())
    .bind(t.status.to_string())
    .bind(&t.payment_transaction_id)
    .bind(&t.transfer_id)
    .bind(&t.failure_reason)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(pool)
    .await
    .context("Failed to create pending transfer")?;
    Ok(())
}

fn row_to_transfer_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<PendingTransfer> {
    Ok(PendingTransfer {
        id: row.get("id"),
        session_id: row.get("session_id"),
        tutor_id: row.get("tutor_id"),
        student_id: row.get("student_id"),
        amount: Cents(row.get("amount")),
        platform_fee: Cents(row.get("platform_fee")),
        processor_fee: Cents(row.get("processor_fee")),
        status: row.get::<String, _>("status").parse()?,
        payment_transaction_id: row.get("payment_transaction_id"),
        transfer_id: row.get("transfer_id"),
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_mysql(pool: &MySqlPool, t: &PendingTransfer) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO pending_transfers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        TRANSFER_COLUMNS
    ))
    .bind(&t.id)
    .bind(&t.session_id)
    .bind(&t.tutor_id)
    .bind(&t.student_id)
    .bind(t.amount.get())
    .bind(t.platform_fee.get())
    .bind(t.processor_fee.get())
    .bind(t.status.to_string())
    .bind(&t.payment_transaction_id)
    .bind(&t.transfer_id)
    .bind(&t.failure_reason)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(pool)
    .await
    .context("Failed to create pending transfer")?;
    Ok(())
}

fn row_to_transfer_mysql(row: &sqlx::mysql::MySqlRow) -> Result<PendingTransfer> {
    Ok(PendingTransfer {
        id: row.get("id"),
        session_id: row.get("session_id"),
        tutor_id: row.get("tutor_id"),
        student_id: row.get("student_id"),
        amount: Cents(row.get("amount")),
        platform_fee: Cents(row.get("platform_fee")),
        processor_fee: Cents(row.get("processor_fee")),
        status: row.get::<String, _>("status").parse()?,
        payment_transaction_id: row.get("payment_transaction_id"),
        transfer_id: row.get("transfer_id"),
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
