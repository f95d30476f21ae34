//! Database layer
//!
//! Persistence for the booking ledger. Supports:
//! - SQLite (default, single-file deployment)
//! - MySQL (for larger deployments)
//!
//! The driver is selected by configuration. Repositories hold a
//! `DynDatabasePool` and dispatch to per-driver SQL.
//!
//! ```ignore
//! use tutorbook::config::DatabaseConfig;
//! use tutorbook::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, is_unique_violation, DatabasePool, DynDatabasePool,
    MysqlDatabase, SqliteDatabase,
};
