//! Tutor profile repository

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::{Cents, TutorProfile, WeeklyAvailability};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

#[async_trait]
pub trait TutorProfileRepository: Send + Sync {
    async fn get(&self, tutor_id: &str) -> Result<Option<TutorProfile>>;

    /// Insert or replace a profile, keeping the original `created_at`
    async fn upsert(&self, profile: &TutorProfile) -> Result<TutorProfile>;

    /// Refresh the onboarding flag for whichever tutor owns the account
    async fn set_onboarding_by_account(
        &self,
        account_id: &str,
        onboarded: bool,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

pub struct SqlxTutorProfileRepository {
    pool: DynDatabasePool,
}

impl SqlxTutorProfileRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn TutorProfileRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl TutorProfileRepository for SqlxTutorProfileRepository {
    async fn get(&self, tutor_id: &str) -> Result<Option<TutorProfile>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => get_sqlite(self.pool.sqlite()?, tutor_id).await,
            DatabaseDriver::Mysql => get_mysql(self.pool.mysql()?, tutor_id).await,
        }
    }

    async fn upsert(&self, profile: &TutorProfile) -> Result<TutorProfile> {
        let availability = serde_json::to_string(&profile.availability)
            .context("Failed to serialize availability")?;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let pool = self.pool.sqlite()?;
                upsert_sqlite(pool, profile, &availability).await?;
                get_sqlite(pool, &profile.tutor_id).await?
            }
            DatabaseDriver::Mysql => {
                let pool = self.pool.mysql()?;
                upsert_mysql(pool, profile, &availability).await?;
                get_mysql(pool, &profile.tutor_id).await?
            }
        }
        .ok_or_else(|| anyhow::anyhow!("Tutor profile not found after upsert"))
    }

    async fn set_onboarding_by_account(
        &self,
        account_id: &str,
        onboarded: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = "UPDATE tutor_profiles SET payout_onboarded = ?, updated_at = ? WHERE payout_account_id = ?";
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(onboarded)
                .bind(now)
                .bind(account_id)
                .execute(self.pool.sqlite()?)
                .await
                .context("Failed to update payout onboarding")?
                .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(onboarded)
                .bind(now)
                .bind(account_id)
                .execute(self.pool.mysql()?)
                .await
                .context("Failed to update payout onboarding")?
                .rows_affected(),
        };
        Ok(affected)
    }
}

fn parse_availability(raw: &str) -> Result<WeeklyAvailability> {
    serde_json::from_str(raw).context("Stored availability is not valid JSON")
}

// SQLite implementations

async fn get_sqlite(pool: &SqlitePool, tutor_id: &str) -> Result<Option<TutorProfile>> {
    let row = sqlx::query(
        "SELECT tutor_id, hourly_rate_cents, payout_account_id, payout_onboarded, availability, created_at, updated_at \
         FROM tutor_profiles WHERE tutor_id = ?",
    )
    .bind(tutor_id)
    .fetch_optional(pool)
    .await
    .context("Failed to get tutor profile")?;

    row.map(|row| {
        Ok(TutorProfile {
            tutor_id: row.get("tutor_id"),
            hourly_rate: Cents(row.get("hourly_rate_cents")),
            payout_account_id: row.get("payout_account_id"),
            payout_onboarded: row.get("payout_onboarded"),
            availability: parse_availability(row.get("availability"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    })
    .transpose()
}

async fn upsert_sqlite(pool: &SqlitePool, profile: &TutorProfile, availability: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tutor_profiles (tutor_id, hourly_rate_cents, payout_account_id, payout_onboarded, availability, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tutor_id) DO UPDATE SET
            hourly_rate_cents = excluded.hourly_rate_cents,
            payout_account_id = excluded.payout_account_id,
            payout_onboarded = excluded.payout_onboarded,
            availability = excluded.availability,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&profile.tutor_id)
    .bind(profile.hourly_rate.get())
    .bind(&profile.payout_account_id)
    .bind(profile.payout_onboarded)
    .bind(availability)
    .bind(profile.created_at)
    .bind(profile.updated_at)
    .execute(pool)
    .await
    .context("Failed to upsert tutor profile")?;
    Ok(())
}

// MySQL implementations

async fn get_mysql(pool: &MySqlPool, tutor_id: &str) -> Result<Option<TutorProfile>> {
    let row = sqlx::query(
        "SELECT tutor_id, hourly_rate_cents, payout_account_id, payout_onboarded, availability, created_at, updated_at \
         FROM tutor_profiles WHERE tutor_id = ?",
    )
    .bind(tutor_id)
    .fetch_optional(pool)
    .await
    .context("Failed to get tutor profile")?;

    row.map(|row| {
        Ok(TutorProfile {
            tutor_id: row.get("tutor_id"),
            hourly_rate: Cents(row.get("hourly_rate_cents")),
            payout_account_id: row.get("payout_account_id"),
            payout_onboarded: row.get("payout_onboarded"),
            availability: parse_availability(row.get("availability"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    })
    .transpose()
}

async fn upsert_mysql(pool: &MySqlPool, profile: &TutorProfile, availability: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tutor_profiles (tutor_id, hourly_rate_cents, payout_account_id, payout_onboarded, availability, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            hourly_rate_cents = VALUES(hourly_rate_cents),
            payout_account_id = VALUES(payout_account_id),
            payout_onboarded = VALUES(payout_onboarded),
            availability = VALUES(availability),
            updated_at = VALUES(updated_at)
        "#,
    )
    .bind(&profile.tutor_id)
    .bind(profile.hourly_rate.get())
    .bind(&profile.payout_account_id)
    .bind(profile.payout_onboarded)
    .bind(availability)
    .bind(profile.created_at)
    .bind(profile.updated_at)
    .execute(pool)
    .await
    .context("Failed to upsert tutor profile")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_test_pool, migrations};
    use crate::models::TimeRange;
    use chrono::{NaiveTime, TimeZone};

    async fn setup() -> Arc<dyn TutorProfileRepository> {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool).await.expect("Failed to run migrations");
        SqlxTutorProfileRepository::boxed(pool)
    }

    fn profile(account: Option<&str>) -> TutorProfile {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut availability = WeeklyAvailability::default();
        availability.monday.push(TimeRange::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        ));
        TutorProfile {
            tutor_id: "tutor-1".to_string(),
            hourly_rate: Cents(6000),
            payout_account_id: account.map(str::to_string),
            payout_onboarded: false,
            availability,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_replaces() {
        let repo = setup().await;
        let created = repo.upsert(&profile(None)).await.unwrap();
        assert_eq!(created, profile(None));

        let mut changed = profile(Some("acct_1"));
        changed.hourly_rate = Cents(7000);
        changed.created_at = Utc::now();
        changed.updated_at = Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap();
        let updated = repo.upsert(&changed).await.unwrap();

        assert_eq!(updated.hourly_rate, Cents(7000));
        assert_eq!(updated.payout_account_id.as_deref(), Some("acct_1"));
        // created_at survives the replace
        assert_eq!(updated.created_at, profile(None).created_at);
        assert_eq!(updated.availability.monday.len(), 1);
    }

    #[tokio::test]
    async fn test_set_onboarding_by_account() {
        let repo = setup().await;
        repo.upsert(&profile(Some("acct_1"))).await.unwrap();

        let affected = repo.set_onboarding_by_account("acct_1", true, Utc::now()).await.unwrap();
        assert_eq!(affected, 1);
        assert!(repo.get("tutor-1").await.unwrap().unwrap().payout_onboarded);

        let affected = repo.set_onboarding_by_account("acct_unknown", true, Utc::now()).await.unwrap();
        assert_eq!(affected, 0);
    }
}
