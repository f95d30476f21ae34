//! Payment transaction repository
//!
//! Ledger rows mirroring processor payment intents. At most one live
//! (`pending`/`processing`) row exists per session; the unique index
//! backs the lookup-before-create guard in the payment gateway.

use crate::config::DatabaseDriver;
use crate::db::{is_unique_violation, DynDatabasePool};
use crate::models::{Cents, PaymentTransaction, TransactionStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

const TRANSACTION_COLUMNS: &str = "id, session_id, student_id, tutor_id, amount, currency, status, \
    payment_intent_id, charge_id, platform_fee, payment_type, requires_transfer, transfer_id, \
    failure_code, failure_message, created_at, updated_at";

/// Fields written alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate<'a> {
    pub charge_id: Option<&'a str>,
    pub failure_code: Option<&'a str>,
    pub failure_message: Option<&'a str>,
}

#[async_trait]
pub trait PaymentTransactionRepository: Send + Sync {
    /// Insert a transaction. Returns false if a live transaction already
    /// exists for the session or the intent is already recorded.
    async fn create(&self, tx: &PaymentTransaction) -> Result<bool>;

    async fn get_by_id(&self, id: &str) -> Result<Option<PaymentTransaction>>;

    async fn get_by_intent_id(&self, intent_id: &str) -> Result<Option<PaymentTransaction>>;

    /// The session's `pending` or `processing` transaction, if any
    async fn find_live_by_session(&self, session_id: &str) -> Result<Option<PaymentTransaction>>;

    /// The session's captured transaction, if any
    async fn find_completed_by_session(&self, session_id: &str) -> Result<Option<PaymentTransaction>>;

    /// Number of transactions ever recorded for the session
    async fn count_by_session(&self, session_id: &str) -> Result<i64>;

    /// Move to `to` only if the current status is one of `from`
    async fn transition_status(
        &self,
        id: &str,
        from: &[TransactionStatus],
        to: TransactionStatus,
        update: TransitionUpdate<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Stamp the executed transfer id; only the first writer wins
    async fn set_transfer_id(&self, id: &str, transfer_id: &str, now: DateTime<Utc>) -> Result<bool>;
}

pub struct SqlxPaymentTransactionRepository {
    pool: DynDatabasePool,
}

impl SqlxPaymentTransactionRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn PaymentTransactionRepository> {
        Arc::new(Self::new(pool))
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl PaymentTransactionRepository for SqlxPaymentTransactionRepository {
    async fn create(&self, tx: &PaymentTransaction) -> Result<bool> {
        let result = match self.pool.driver() {
            DatabaseDriver::Sqlite => create_sqlite(self.pool.sqlite()?, tx).await,
            DatabaseDriver::Mysql => create_mysql(self.pool.mysql()?, tx).await,
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<PaymentTransaction>> {
        self.fetch_one_where("id = ?", id).await
    }

    async fn get_by_intent_id(&self, intent_id: &str) -> Result<Option<PaymentTransaction>> {
        self.fetch_one_where("payment_intent_id = ?", intent_id).await
    }

    async fn find_live_by_session(&self, session_id: &str) -> Result<Option<PaymentTransaction>> {
        self.fetch_one_where("session_id = ? AND status IN ('pending', 'processing')", session_id)
            .await
    }

    async fn find_completed_by_session(&self, session_id: &str) -> Result<Option<PaymentTransaction>> {
        self.fetch_one_where("session_id = ? AND status = 'completed'", session_id)
            .await
    }

    async fn count_by_session(&self, session_id: &str) -> Result<i64> {
        let sql = "SELECT COUNT(*) as count FROM payment_transactions WHERE session_id = ?";
        let count = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(session_id)
                .fetch_one(self.pool.sqlite()?)
                .await
                .context("Failed to count transactions")?
                .get::<i64, _>("count"),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(session_id)
                .fetch_one(self.pool.mysql()?)
                .await
                .context("Failed to count transactions")?
                .get::<i64, _>("count"),
        };
        Ok(count)
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[TransactionStatus],
        to: TransactionStatus,
        update: TransitionUpdate<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE payment_transactions SET status = ?, charge_id = COALESCE(?, charge_id), \
             failure_code = COALESCE(?, failure_code), failure_message = COALESCE(?, failure_message), \
             updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut query = sqlx::query(&sql)
                    .bind(to.to_string())
                    .bind(update.charge_id)
                    .bind(update.failure_code)
                    .bind(update.failure_message)
                    .bind(now)
                    .bind(id);
                for status in from {
                    query = query.bind(status.to_string());
                }
                let result = query
                    .execute(self.pool.sqlite()?)
                    .await
                    .context("Failed to transition transaction status")?;
                Ok(result.rows_affected() == 1)
            }
            DatabaseDriver::Mysql => {
                let mut query = sqlx::query(&sql)
                    .bind(to.to_string())
                    .bind(update.charge_id)
                    .bind(update.failure_code)
                    .bind(update.failure_message)
                    .bind(now)
                    .bind(id);
                for status in from {
                    query = query.bind(status.to_string());
                }
                let result = query
                    .execute(self.pool.mysql()?)
                    .await
                    .context("Failed to transition transaction status")?;
                Ok(result.rows_affected() == 1)
            }
        }
    }

    async fn set_transfer_id(&self, id: &str, transfer_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = "UPDATE payment_transactions SET transfer_id = ?, updated_at = ? \
                   WHERE id = ? AND transfer_id IS NULL";
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(transfer_id)
                .bind(now)
                .bind(id)
                .execute(self.pool.sqlite()?)
                .await
                .context("Failed to set transfer id")?
                .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(transfer_id)
                .bind(now)
                .bind(id)
                .execute(self.pool.mysql()?)
                .await
                .context("Failed to set transfer id")?
                .rows_affected(),
        };
        Ok(affected == 1)
    }
}

impl SqlxPaymentTransactionRepository {
    async fn fetch_one_where(&self, condition: &str, value: &str) -> Result<Option<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE {} ORDER BY created_at DESC LIMIT 1",
            TRANSACTION_COLUMNS, condition
        );
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let row = sqlx::query(&sql)
                    .bind(value)
                    .fetch_optional(self.pool.sqlite()?)
                    .await
                    .context("Failed to get payment transaction")?;
                row.map(|r| row_to_transaction_sqlite(&r)).transpose()
            }
            DatabaseDriver::Mysql => {
                let row = sqlx::query(&sql)
                    .bind(value)
                    .fetch_optional(self.pool.mysql()?)
                    .await
                    .context("Failed to get payment transaction")?;
                row.map(|r| row_to_transaction_mysql(&r)).transpose()
            }
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_sqlite(pool: &SqlitePool, tx: &PaymentTransaction) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO payment_transactions ({}) VALUES ({})",
        TRANSACTION_COLUMNS,
        placeholders(17)
    ))
    .bind(&tx.id)
    .bind(&tx.session_id)
    .bind(&tx.student_id)
    .bind(&tx.tutor_id)
    .bind(tx.amount.get())
    .bind(&tx.currency)
    .bind(tx.status.to_string())
    .bind(&tx.payment_intent_id)
    .bind(&tx.charge_id)
    .bind(tx.platform_fee.get())
    .bind(tx.payment_type.to_string())
    .bind(tx.requires_transfer)
    .bind(&tx.transfer_id)
    .bind(&tx.failure_code)
    .bind(&tx.failure_message)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .execute(pool)
    .await
    .context("Failed to create payment transaction")?;
    Ok(())
}

fn row_to_transaction_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<PaymentTransaction> {
    Ok(PaymentTransaction {
        id: row.get("id"),
        session_id: row.get("session_id"),
        student_id: row.get("student_id"),
        tutor_id: row.get("tutor_id"),
        amount: Cents(row.get("amount")),
        currency: row.get("currency"),
        status: row.get::<String, _>("status").parse()?,
        payment_intent_id: row.get("payment_intent_id"),
        charge_id: row.get("charge_id"),
        platform_fee: Cents(row.get("platform_fee")),
        payment_type: row.get::<String, _>("payment_type").parse()?,
        requires_transfer: row.get("requires_transfer"),
        transfer_id: row.get("transfer_id"),
        failure_code: row.get("failure_code"),
        failure_message: row.get("failure_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_mysql(pool: &MySqlPool, tx: &PaymentTransaction) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO payment_transactions ({}) VALUES ({})",
        TRANSACTION_COLUMNS,
        placeholders(17)
    ))
    .bind(&tx.id)
    .bind(&tx.session_id)
    .bind(&tx.student_id)
    .bind(&tx.tutor_id)
    .bind(tx.amount.get())
    .bind(&tx.currency)
    .bind(tx.status.to_string())
    .bind(&tx.payment_intent_id)
    .bind(&tx.charge_id)
    .bind(tx.platform_fee.get())
    .bind(tx.payment_type.to_string())
    .bind(tx.requires_transfer)
    .bind(&tx.transfer_id)
    .bind(&tx.failure_code)
    .bind(&tx.failure_message)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .execute(pool)
    .await
    .context("Failed to create payment transaction")?;
    Ok(())
}

fn row_to_transaction_mysql(row: &sqlx::mysql::MySqlRow) -> Result<PaymentTransaction> {
    Ok(PaymentTransaction {
        id: row.get("id"),
        session_id: row.get("session_id"),
        student_id: row.get("student_id"),
        tutor_id: row.get("tutor_id"),
        amount: Cents(row.get("amount")),
        currency: row.get("currency"),
        status: row.get::<String, _>("status").parse()?,
        payment_intent_id: row.get("payment_intent_id"),
        charge_id: row.get("charge_id"),
        platform_fee: Cents(row.get("platform_fee")),
        payment_type: row.get::<String, _>("payment_type").parse()?,
        requires_transfer: row.get("requires_transfer"),
        transfer_id: row.get("transfer_id"),
        failure_code: row.get("failure_code"),
        failure_message: row.get("failure_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
