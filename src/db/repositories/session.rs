//! Session repository
//!
//! Every mutation here is a conditional update keyed on the row's current
//! state; callers read `rows_affected` to learn whether they won.

use crate::config::DatabaseDriver;
use crate::db::{is_unique_violation, DynDatabasePool};
use crate::models::{Cents, RefundStatus, Role, Session, SessionPaymentStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

const SESSION_COLUMNS: &str = "id, tutor_id, student_id, course_id, start_time, end_time, status, \
    session_type, location, meeting_url, notes, price_cents, tutor_confirmed, student_confirmed, \
    completion_date, cancelled_by, cancelled_by_role, cancelled_at, cancellation_reason, \
    hours_before_session, refund_amount, refund_status, refund_id, payment_status, created_at, updated_at";

/// Cancellation fields written together with the status change
#[derive(Debug, Clone)]
pub struct CancellationRecord {
    pub cancelled_by: String,
    pub role: Role,
    pub cancelled_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub hours_before_session: i64,
    pub refund_amount: Cents,
    pub refund_status: RefundStatus,
}

/// Session repository trait
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new session. Returns false when the tutor already has a
    /// non-cancelled session at that start time.
    async fn create(&self, session: &Session) -> Result<bool>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>>;

    /// Non-cancelled sessions of a tutor intersecting `[from, to)`
    async fn list_active_for_tutor_between(
        &self,
        tutor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Whether `[start, end)` overlaps a non-cancelled session of the tutor
    async fn has_overlap(&self, tutor_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool>;

    /// Set one party's confirmation flag while the session is still open
    async fn set_confirmation(&self, id: &str, role: Role, now: DateTime<Utc>) -> Result<bool>;

    /// Move to `completed` iff both flags are set and completion has not
    /// been recorded. Exactly one caller observes `true`.
    async fn mark_completed(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Move an open, uncompleted session to `cancelled`
    async fn mark_cancelled(&self, id: &str, record: &CancellationRecord) -> Result<bool>;

    async fn set_payment_status(&self, id: &str, status: SessionPaymentStatus, now: DateTime<Utc>) -> Result<()>;

    /// Record a captured payment; a `pending` session becomes `confirmed`
    async fn mark_paid(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn set_refund_outcome(
        &self,
        id: &str,
        status: RefundStatus,
        refund_id: Option<&str>,
        payment_status: Option<SessionPaymentStatus>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Replace the refund owed on a cancelled session
    async fn set_refund_amount(&self, id: &str, amount: Cents, status: RefundStatus, now: DateTime<Utc>) -> Result<()>;
}

/// SQLx-based session repository implementation
pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
        Arc::new(Self::new(pool))
    }
}

fn confirmation_column(role: Role) -> &'static str {
    match role {
        Role::Tutor => "tutor_confirmed",
        Role::Student => "student_confirmed",
    }
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn create(&self, session: &Session) -> Result<bool> {
        let result = match self.pool.driver() {
            DatabaseDriver::Sqlite => create_sqlite(self.pool.sqlite()?, session).await,
            DatabaseDriver::Mysql => create_mysql(self.pool.mysql()?, session).await,
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => get_by_id_sqlite(self.pool.sqlite()?, id).await,
            DatabaseDriver::Mysql => get_by_id_mysql(self.pool.mysql()?, id).await,
        }
    }

    async fn list_active_for_tutor_between(
        &self,
        tutor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                list_active_between_sqlite(self.pool.sqlite()?, tutor_id, from, to).await
            }
            DatabaseDriver::Mysql => {
                list_active_between_mysql(self.pool.mysql()?, tutor_id, from, to).await
            }
        }
    }

    async fn has_overlap(&self, tutor_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => has_overlap_sqlite(self.pool.sqlite()?, tutor_id, start, end).await,
            DatabaseDriver::Mysql => has_overlap_mysql(self.pool.mysql()?, tutor_id, start, end).await,
        }
    }

    async fn set_confirmation(&self, id: &str, role: Role, now: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            "UPDATE sessions SET {} = 1, updated_at = ? WHERE id = ? AND status IN ('pending', 'confirmed')",
            confirmation_column(role)
        );
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(&sql)
                .bind(now)
                .bind(id)
                .execute(self.pool.sqlite()?)
                .await
                .context("Failed to set confirmation flag")?
                .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(&sql)
                .bind(now)
                .bind(id)
                .execute(self.pool.mysql()?)
                .await
                .context("Failed to set confirmation flag")?
                .rows_affected(),
        };
        Ok(affected > 0)
    }

    async fn mark_completed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => mark_completed_sqlite(self.pool.sqlite()?, id, now).await,
            DatabaseDriver::Mysql => mark_completed_mysql(self.pool.mysql()?, id, now).await,
        }
    }

    async fn mark_cancelled(&self, id: &str, record: &CancellationRecord) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => mark_cancelled_sqlite(self.pool.sqlite()?, id, record).await,
            DatabaseDriver::Mysql => mark_cancelled_mysql(self.pool.mysql()?, id, record).await,
        }
    }

    async fn set_payment_status(&self, id: &str, status: SessionPaymentStatus, now: DateTime<Utc>) -> Result<()> {
        let sql = "UPDATE sessions SET payment_status = ?, updated_at = ? WHERE id = ?";
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query(sql)
                    .bind(status.to_string())
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.sqlite()?)
                    .await
                    .context("Failed to update session payment status")?;
            }
            DatabaseDriver::Mysql => {
                sqlx::query(sql)
                    .bind(status.to_string())
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.mysql()?)
                    .await
                    .context("Failed to update session payment status")?;
            }
        }
        Ok(())
    }

    async fn mark_paid(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let sql = "UPDATE sessions SET payment_status = 'paid', \
                   status = CASE WHEN status = 'pending' THEN 'confirmed' ELSE status END, \
                   updated_at = ? WHERE id = ?";
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query(sql)
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.sqlite()?)
                    .await
                    .context("Failed to mark session paid")?;
            }
            DatabaseDriver::Mysql => {
                sqlx::query(sql)
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.mysql()?)
                    .await
                    .context("Failed to mark session paid")?;
            }
        }
        Ok(())
    }

    async fn set_refund_outcome(
        &self,
        id: &str,
        status: RefundStatus,
        refund_id: Option<&str>,
        payment_status: Option<SessionPaymentStatus>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sql = "UPDATE sessions SET refund_status = ?, refund_id = COALESCE(?, refund_id), \
                   payment_status = COALESCE(?, payment_status), updated_at = ? WHERE id = ?";
        let payment_status = payment_status.map(|s| s.to_string());
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query(sql)
                    .bind(status.to_string())
                    .bind(refund_id)
                    .bind(payment_status)
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.sqlite()?)
                    .await
                    .context("Failed to record refund outcome")?;
            }
            DatabaseDriver::Mysql => {
                sqlx::query(sql)
                    .bind(status.to_string())
                    .bind(refund_id)
                    .bind(payment_status)
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.mysql()?)
                    .await
                    .context("Failed to record refund outcome")?;
            }
        }
        Ok(())
    }

    async fn set_refund_amount(&self, id: &str, amount: Cents, status: RefundStatus, now: DateTime<Utc>) -> Result<()> {
        let sql = "UPDATE sessions SET refund_amount = ?, refund_status = ?, updated_at = ? \
                   WHERE id = ? AND status = 'cancelled'";
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query(sql)
                    .bind(amount.get())
                    .bind(status.to_string())
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.sqlite()?)
                    .await
                    .context("Failed to record refund amount")?;
            }
            DatabaseDriver::Mysql => {
                sqlx::query(sql)
                    .bind(amount.get())
                    .bind(status.to_string())
                    .bind(now)
                    .bind(id)
                    .execute(self.pool.mysql()?)
                    .await
                    .context("Failed to record refund amount")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_sqlite(pool: &SqlitePool, session: &Session) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, tutor_id, student_id, course_id, start_time, end_time, status,
            session_type, location, meeting_url, notes, price_cents, tutor_confirmed, student_confirmed,
            payment_status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.tutor_id)
    .bind(&session.student_id)
    .bind(&session.course_id)
    .bind(session.start_time)
    .bind(session.end_time)
    .bind(session.status.to_string())
    .bind(session.session_type.to_string())
    .bind(&session.location)
    .bind(&session.meeting_url)
    .bind(&session.notes)
    .bind(session.price.get())
    .bind(session.tutor_confirmed)
    .bind(session.student_confirmed)
    .bind(session.payment_status.to_string())
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(())
}

async fn get_by_id_sqlite(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by ID")?;
    row.map(|r| row_to_session_sqlite(&r)).transpose()
}

async fn list_active_between_sqlite(
    pool: &SqlitePool,
    tutor_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM sessions WHERE tutor_id = ? AND status != 'cancelled' \
         AND start_time < ? AND end_time > ? ORDER BY start_time",
        SESSION_COLUMNS
    ))
    .bind(tutor_id)
    .bind(to)
    .bind(from)
    .fetch_all(pool)
    .await
    .context("Failed to list tutor sessions")?;
    rows.iter().map(row_to_session_sqlite).collect()
}

async fn has_overlap_sqlite(
    pool: &SqlitePool,
    tutor_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) as count FROM sessions WHERE tutor_id = ? AND status != 'cancelled' \
         AND start_time < ? AND end_time > ?",
    )
    .bind(tutor_id)
    .bind(end)
    .bind(start)
    .fetch_one(pool)
    .await
    .context("Failed to check session overlap")?;
    Ok(row.get::<i64, _>("count") > 0)
}

async fn mark_completed_sqlite(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions SET status = 'completed', completion_date = ?, updated_at = ?
        WHERE id = ? AND tutor_confirmed = 1 AND student_confirmed = 1
          AND completion_date IS NULL AND cancelled_at IS NULL
          AND status IN ('pending', 'confirmed')
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark session completed")?;
    Ok(result.rows_affected() == 1)
}

async fn mark_cancelled_sqlite(pool: &SqlitePool, id: &str, record: &CancellationRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions SET status = 'cancelled', cancelled_by = ?, cancelled_by_role = ?,
            cancelled_at = ?, cancellation_reason = ?, hours_before_session = ?,
            refund_amount = ?, refund_status = ?, updated_at = ?
        WHERE id = ? AND status IN ('pending', 'confirmed') AND completion_date IS NULL
        "#,
    )
    .bind(&record.cancelled_by)
    .bind(record.role.to_string())
    .bind(record.cancelled_at)
    .bind(&record.reason)
    .bind(record.hours_before_session)
    .bind(record.refund_amount.get())
    .bind(record.refund_status.to_string())
    .bind(record.cancelled_at)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to cancel session")?;
    Ok(result.rows_affected() == 1)
}

fn row_to_session_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        tutor_id: row.get("tutor_id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        status: row.get::<String, _>("status").parse()?,
        session_type: row.get::<String, _>("session_type").parse()?,
        location: row.get("location"),
        meeting_url: row.get("meeting_url"),
        notes: row.get("notes"),
        price: Cents(row.get("price_cents")),
        tutor_confirmed: row.get("tutor_confirmed"),
        student_confirmed: row.get("student_confirmed"),
        completion_date: row.get("completion_date"),
        cancelled_by: row.get("cancelled_by"),
        cancelled_by_role: row
            .get::<Option<String>, _>("cancelled_by_role")
            .map(|s| s.parse())
            .transpose()?,
        cancelled_at: row.get("cancelled_at"),
        cancellation_reason: row.get("cancellation_reason"),
        hours_before_session: row.get("hours_before_session"),
        refund_amount: row.get::<Option<i64>, _>("refund_amount").map(Cents),
        refund_status: row
            .get::<Option<String>, _>("refund_status")
            .map(|s| s.parse())
            .transpose()?,
        refund_id: row.get("refund_id"),
        payment_status: row.get::<String, _>("payment_status").parse()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_mysql(pool: &MySqlPool, session: &Session) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, tutor_id, student_id, course_id, start_time, end_time, status,
            session_type, location, meeting_url, notes, price_cents, tutor_confirmed, student_confirmed,
            payment_status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.tutor_id)
    .bind(&session.student_id)
    .bind(&session.course_id)
    .bind(session.start_time)
    .bind(session.end_time)
    .bind(session.status.to_string())
    .bind(session.session_type.to_string())
    .bind(&session.location)
    .bind(&session.meeting_url)
    .bind(&session.notes)
    .bind(session.price.get())
    .bind(session.tutor_confirmed)
    .bind(session.student_confirmed)
    .bind(session.payment_status.to_string())
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(())
}

async fn get_by_id_mysql(pool: &MySqlPool, id: &str) -> Result<Option<Session>> {
    let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by ID")?;
    row.map(|r| row_to_session_mysql(&r)).transpose()
}

async fn list_active_between_mysql(
    pool: &MySqlPool,
    tutor_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM sessions WHERE tutor_id = ? AND status <> 'cancelled' \
         AND start_time < ? AND end_time > ? ORDER BY start_time",
        SESSION_COLUMNS
    ))
    .bind(tutor_id)
    .bind(to)
    .bind(from)
    .fetch_all(pool)
    .await
    .context("Failed to list tutor sessions")?;
    rows.iter().map(row_to_session_mysql).collect()
}

async fn has_overlap_mysql(
    pool: &MySqlPool,
    tutor_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) as count FROM sessions WHERE tutor_id = ? AND status <> 'cancelled' \
         AND start_time < ? AND end_time > ?",
    )
    .bind(tutor_id)
    .bind(end)
    .bind(start)
    .fetch_one(pool)
    .await
    .context("Failed to check session overlap")?;
    Ok(row.get::<i64, _>("count") > 0)
}

async fn mark_completed_mysql(pool: &MySqlPool, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions SET status = 'completed', completion_date = ?, updated_at = ?
        WHERE id = ? AND tutor_confirmed = TRUE AND student_confirmed = TRUE
          AND completion_date IS NULL AND cancelled_at IS NULL
          AND status IN ('pending', 'confirmed')
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark session completed")?;
    Ok(result.rows_affected() == 1)
}

async fn mark_cancelled_mysql(pool: &MySqlPool, id: &str, record: &CancellationRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions SET status = 'cancelled', cancelled_by = ?, cancelled_by_role = ?,
            cancelled_at = ?, cancellation_reason = ?, hours_before_session = ?,
            refund_amount = ?, refund_status = ?, updated_at = ?
        WHERE id = ? AND status IN ('pending', 'confirmed') AND completion_date IS NULL
        "#,
    )
    .bind(&record.cancelled_by)
    .bind(record.role.to_string())
    .bind(record.cancelled_at)
    .bind(&record.reason)
    .bind(record.hours_before_session)
    .bind(record.refund_amount.get())
    .bind(record.refund_status.to_string())
    .bind(record.cancelled_at)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to cancel session")?;
    Ok(result.rows_affected() == 1)
}

fn row_to_session_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        tutor_id: row.get("tutor_id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        status: row.get::<String, _>("status").parse()?,
        session_type: row.get::<String, _>("session_type").parse()?,
        location: row.get("location"),
        meeting_url: row.get("meeting_url"),
        notes: row.get("notes"),
        price: Cents(row.get("price_cents")),
        tutor_confirmed: row.get("tutor_confirmed"),
        student_confirmed: row.get("student_confirmed"),
        completion_date: row.get("completion_date"),
        cancelled_by: row.get("cancelled_by"),
        cancelled_by_role: row
            .get::<Option<String>, _>("cancelled_by_role")
            .map(|s| s.parse())
            .transpose()?,
        cancelled_at: row.get("cancelled_at"),
        cancellation_reason: row.get("cancellation_reason"),
        hours_before_session: row.get("hours_before_session"),
        refund_amount: row.get::<Option<i64>, _>("refund_amount").map(Cents),
        refund_status: row
            .get::<Option<String>, _>("refund_status")
            .map(|s| s.parse())
            .transpose()?,
        refund_id: row.get("refund_id"),
        payment_status: row.get::<String, _>("payment_status").parse()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
