//! Database migrations
//!
//! Code-based migrations embedded in the binary, with SQL for both SQLite
//! and MySQL.
//!
//! ```ignore
//! use tutorbook::db::{create_pool, migrations};
//!
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! ```
//!
//! The conditional-write guards of the booking core rely on the unique
//! indexes declared here:
//! - one non-cancelled session per tutor start time,
//! - one live (`pending`/`processing`) transaction per session,
//! - one pending transfer per session,
//! - one row per processor webhook event.
//!
//! SQLite uses partial indexes; MySQL uses stored generated columns that
//! are NULL outside the guarded states.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};

use super::DynDatabasePool;
use crate::config::DatabaseDriver;

/// A database migration with SQL for both SQLite and MySQL
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version number (must be unique and sequential)
    pub version: i32,
    pub name: &'static str,
    pub up_sqlite: &'static str,
    pub up_mysql: &'static str,
}

/// Migration record stored in the database
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_tutor_profiles_table",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS tutor_profiles (
                tutor_id VARCHAR(64) PRIMARY KEY,
                hourly_rate_cents INTEGER NOT NULL CHECK (hourly_rate_cents > 0),
                payout_account_id VARCHAR(255),
                payout_onboarded INTEGER NOT NULL DEFAULT 0,
                availability TEXT NOT NULL DEFAULT '{}',
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tutor_profiles_payout_account ON tutor_profiles(payout_account_id);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS tutor_profiles (
                tutor_id VARCHAR(64) PRIMARY KEY,
                hourly_rate_cents BIGINT NOT NULL CHECK (hourly_rate_cents > 0),
                payout_account_id VARCHAR(255),
                payout_onboarded BOOLEAN NOT NULL DEFAULT FALSE,
                availability TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                INDEX idx_tutor_profiles_payout_account (payout_account_id)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
        "#,
    },
    Migration {
        version: 2,
        name: "create_sessions_table",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id VARCHAR(36) PRIMARY KEY,
                tutor_id VARCHAR(64) NOT NULL,
                student_id VARCHAR(64) NOT NULL,
                course_id VARCHAR(64),
                start_time TIMESTAMP NOT NULL,
                end_time TIMESTAMP NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                session_type VARCHAR(20) NOT NULL DEFAULT 'virtual',
                location TEXT,
                meeting_url TEXT,
                notes TEXT,
                price_cents INTEGER NOT NULL,
                tutor_confirmed INTEGER NOT NULL DEFAULT 0,
                student_confirmed INTEGER NOT NULL DEFAULT 0,
                completion_date TIMESTAMP,
                cancelled_by VARCHAR(64),
                cancelled_by_role VARCHAR(20),
                cancelled_at TIMESTAMP,
                cancellation_reason TEXT,
                hours_before_session INTEGER,
                refund_amount INTEGER,
                refund_status VARCHAR(20),
                refund_id VARCHAR(255),
                payment_status VARCHAR(20) NOT NULL DEFAULT 'unpaid',
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                CHECK (end_time > start_time),
                CHECK (NOT (status = 'completed' AND cancelled_at IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_tutor_start ON sessions(tutor_id, start_time);
            CREATE INDEX IF NOT EXISTS idx_sessions_student ON sessions(student_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_slot ON sessions(tutor_id, start_time) WHERE status != 'cancelled';
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id VARCHAR(36) PRIMARY KEY,
                tutor_id VARCHAR(64) NOT NULL,
                student_id VARCHAR(64) NOT NULL,
                course_id VARCHAR(64),
                start_time DATETIME NOT NULL,
                end_time DATETIME NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                session_type VARCHAR(20) NOT NULL DEFAULT 'virtual',
                location TEXT,
                meeting_url TEXT,
                notes TEXT,
                price_cents BIGINT NOT NULL,
                tutor_confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                student_confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                completion_date DATETIME,
                cancelled_by VARCHAR(64),
                cancelled_by_role VARCHAR(20),
                cancelled_at DATETIME,
                cancellation_reason TEXT,
                hours_before_session BIGINT,
                refund_amount BIGINT,
                refund_status VARCHAR(20),
                refund_id VARCHAR(255),
                payment_status VARCHAR(20) NOT NULL DEFAULT 'unpaid',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                active_slot VARCHAR(100) AS (CASE WHEN status <> 'cancelled' THEN CONCAT(tutor_id, '|', start_time) END) STORED,
                CHECK (end_time > start_time),
                CHECK (NOT (status = 'completed' AND cancelled_at IS NOT NULL)),
                INDEX idx_sessions_tutor_start (tutor_id, start_time),
                INDEX idx_sessions_student (student_id),
                UNIQUE KEY uk_sessions_active_slot (active_slot)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
        "#,
    },
    Migration {
        version: 3,
        name: "create_payment_transactions_table",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS payment_transactions (
                id VARCHAR(36) PRIMARY KEY,
                session_id VARCHAR(36) NOT NULL REFERENCES sessions(id),
                student_id VARCHAR(64) NOT NULL,
                tutor_id VARCHAR(64) NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                currency VARCHAR(3) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                payment_intent_id VARCHAR(255) NOT NULL UNIQUE,
                charge_id VARCHAR(255),
                platform_fee INTEGER NOT NULL DEFAULT 0,
                payment_type VARCHAR(20) NOT NULL,
                requires_transfer INTEGER NOT NULL DEFAULT 0,
                transfer_id VARCHAR(255),
                failure_code VARCHAR(255),
                failure_message TEXT,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payment_transactions_session ON payment_transactions(session_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_transactions_live_session ON payment_transactions(session_id) WHERE status IN ('pending', 'processing');
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS payment_transactions (
                id VARCHAR(36) PRIMARY KEY,
                session_id VARCHAR(36) NOT NULL,
                student_id VARCHAR(64) NOT NULL,
                tutor_id VARCHAR(64) NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                currency VARCHAR(3) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                payment_intent_id VARCHAR(255) NOT NULL,
                charge_id VARCHAR(255),
                platform_fee BIGINT NOT NULL DEFAULT 0,
                payment_type VARCHAR(20) NOT NULL,
                requires_transfer BOOLEAN NOT NULL DEFAULT FALSE,
                transfer_id VARCHAR(255),
                failure_code VARCHAR(255),
                failure_message TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                live_session_id VARCHAR(36) AS (CASE WHEN status IN ('pending', 'processing') THEN session_id END) STORED,
                UNIQUE KEY uk_payment_transactions_intent (payment_intent_id),
                UNIQUE KEY uk_payment_transactions_live_session (live_session_id),
                INDEX idx_payment_transactions_session (session_id),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
        "#,
    },
    Migration {
        version: 4,
        name: "create_pending_transfers_table",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS pending_transfers (
                id VARCHAR(36) PRIMARY KEY,
                session_id VARCHAR(36) NOT NULL UNIQUE REFERENCES sessions(id),
                tutor_id VARCHAR(64) NOT NULL,
                student_id VARCHAR(64) NOT NULL,
                amount INTEGER NOT NULL CHECK (amount >= 0),
                platform_fee INTEGER NOT NULL CHECK (platform_fee >= 0),
                processor_fee INTEGER NOT NULL CHECK (processor_fee >= 0),
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                payment_transaction_id VARCHAR(36) NOT NULL REFERENCES payment_transactions(id),
                transfer_id VARCHAR(255),
                failure_reason TEXT,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_transfers_tutor_status ON pending_transfers(tutor_id, status);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS pending_transfers (
                id VARCHAR(36) PRIMARY KEY,
                session_id VARCHAR(36) NOT NULL,
                tutor_id VARCHAR(64) NOT NULL,
                student_id VARCHAR(64) NOT NULL,
                amount BIGINT NOT NULL CHECK (amount >= 0),
                platform_fee BIGINT NOT NULL CHECK (platform_fee >= 0),
                processor_fee BIGINT NOT NULL CHECK (processor_fee >= 0),
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                payment_transaction_id VARCHAR(36) NOT NULL,
                transfer_id VARCHAR(255),
                failure_reason TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE KEY uk_pending_transfers_session (session_id),
                INDEX idx_pending_transfers_tutor_status (tutor_id, status),
                FOREIGN KEY (session_id) REFERENCES sessions(id),
                FOREIGN KEY (payment_transaction_id) REFERENCES payment_transactions(id)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
        "#,
    },
    Migration {
        version: 5,
        name: "create_webhook_events_table",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id VARCHAR(255) PRIMARY KEY,
                event_type VARCHAR(100) NOT NULL,
                received_at TIMESTAMP NOT NULL
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id VARCHAR(255) PRIMARY KEY,
                event_type VARCHAR(100) NOT NULL,
                received_at DATETIME NOT NULL
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
        "#,
    },
];

/// Run all pending migrations.
///
/// Returns the number of migrations applied.
pub async fn run_migrations(pool: &DynDatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let applied = get_applied_migrations(pool).await?;
    let applied_versions: Vec<i32> = applied.iter().map(|m| m.version as i32).collect();

    let mut count = 0;

    for migration in MIGRATIONS {
        if !applied_versions.contains(&migration.version) {
            tracing::info!(
                "Applying migration {}: {}",
                migration.version,
                migration.name
            );
            apply_migration(pool, migration)
                .await
                .with_context(|| format!("Failed to apply migration: {}", migration.name))?;
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Applied {} migration(s)", count);
    } else {
        tracing::debug!("No pending migrations");
    }

    Ok(count)
}

/// Create the migrations tracking table if it doesn't exist
async fn create_migrations_table(pool: &DynDatabasePool) -> Result<()> {
    let sql = match pool.driver() {
        DatabaseDriver::Sqlite => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        }
        DatabaseDriver::Mysql => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INT PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        }
    };

    pool.execute(sql).await?;
    Ok(())
}

async fn get_applied_migrations(pool: &DynDatabasePool) -> Result<Vec<MigrationRecord>> {
    match pool.driver() {
        DatabaseDriver::Sqlite => get_applied_migrations_sqlite(pool.sqlite()?).await,
        DatabaseDriver::Mysql => get_applied_migrations_mysql(pool.mysql()?).await,
    }
}

async fn get_applied_migrations_sqlite(pool: &SqlitePool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT version, name, applied_at FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .context("Failed to read applied migrations")?;

    Ok(rows
        .iter()
        .map(|row| MigrationRecord {
            version: row.get("version"),
            name: row.get("name"),
            applied_at: row.get("applied_at"),
        })
        .collect())
}

async fn get_applied_migrations_mysql(pool: &MySqlPool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT version, name, applied_at FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .context("Failed to read applied migrations")?;

    Ok(rows
        .iter()
        .map(|row| MigrationRecord {
            version: row.get::<i32, _>("version") as i64,
            name: row.get("name"),
            applied_at: row.get("applied_at"),
        })
        .collect())
}

async fn apply_migration(pool: &DynDatabasePool, migration: &Migration) -> Result<()> {
    match pool.driver() {
        DatabaseDriver::Sqlite => apply_migration_sqlite(pool.sqlite()?, migration).await,
        DatabaseDriver::Mysql => apply_migration_mysql(pool.mysql()?, migration).await,
    }
}

async fn apply_migration_sqlite(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to begin migration")?;
    for statement in split_sql_statements(migration.up_sqlite) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await.context("Failed to commit migration")?;
    Ok(())
}

async fn apply_migration_mysql(pool: &MySqlPool, migration: &Migration) -> Result<()> {
    // MySQL DDL commits implicitly, so statements run one by one
    for statement in split_sql_statements(migration.up_mysql) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Truncate SQL for error messages
fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}

/// Split SQL into individual statements, dropping comment-only fragments
fn split_sql_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty() && !is_comment_only(stmt))
        .collect()
}

fn is_comment_only(s: &str) -> bool {
    s.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

/// Check if migrations are up to date
pub async fn is_up_to_date(pool: &DynDatabasePool) -> Result<bool> {
    create_migrations_table(pool).await?;
    let applied = get_applied_migrations(pool).await?;
    Ok(applied.len() == MIGRATIONS.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    async fn migrated_pool() -> DynDatabasePool {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
        pool
    }

    async fn table_exists(pool: &DynDatabasePool, name: &str) -> bool {
        let row = sqlx::query("SELECT COUNT(*) as count FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(pool.sqlite().unwrap())
            .await
            .unwrap();
        row.get::<i64, _>("count") == 1
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await.expect("Failed to create test pool");

        let count = run_migrations(&pool).await.expect("Failed to run migrations");
        assert_eq!(count, MIGRATIONS.len());

        // Second run applies nothing
        let count = run_migrations(&pool).await.expect("Failed to run migrations");
        assert_eq!(count, 0);
        assert!(is_up_to_date(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = migrated_pool().await;
        for table in [
            "tutor_profiles",
            "sessions",
            "payment_transactions",
            "pending_transfers",
            "webhook_events",
        ] {
            assert!(table_exists(&pool, table).await, "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_active_slot_unique_ignores_cancelled() {
        let pool = migrated_pool().await;
        let insert = |id: &'static str, status: &'static str| {
            format!(
                "INSERT INTO sessions (id, tutor_id, student_id, start_time, end_time, status, price_cents, created_at, updated_at) \
                 VALUES ('{}', 't1', 's1', '2026-03-02T09:00:00+00:00', '2026-03-02T10:00:00+00:00', '{}', 5000, '2026-03-01T00:00:00+00:00', '2026-03-01T00:00:00+00:00')",
                id, status
            )
        };

        pool.execute(&insert("a", "cancelled")).await.unwrap();
        pool.execute(&insert("b", "pending")).await.unwrap();
        assert!(pool.execute(&insert("c", "confirmed")).await.is_err());
    }

    #[tokio::test]
    async fn test_session_time_check_constraint() {
        let pool = migrated_pool().await;
        let result = pool
            .execute(
                "INSERT INTO sessions (id, tutor_id, student_id, start_time, end_time, price_cents, created_at, updated_at) \
                 VALUES ('x', 't1', 's1', '2026-03-02T10:00:00+00:00', '2026-03-02T09:00:00+00:00', 5000, '2026-03-01T00:00:00+00:00', '2026-03-01T00:00:00+00:00')",
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_split_sql_statements() {
        let sql = "CREATE TABLE a (id INT); CREATE TABLE b (id INT);";
        assert_eq!(split_sql_statements(sql).len(), 2);

        let sql_with_comments = "-- Comment\nCREATE TABLE a (id INT);\n-- trailing";
        assert_eq!(split_sql_statements(sql_with_comments).len(), 1);
    }

    #[test]
    fn test_is_comment_only() {
        assert!(is_comment_only("-- This is a comment"));
        assert!(is_comment_only("-- Line 1\n-- Line 2"));
        assert!(!is_comment_only("-- Comment\nCREATE TABLE test"));
    }

    #[test]
    fn test_migration_versions_are_sequential() {
        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version as usize, idx + 1);
        }
    }
}
