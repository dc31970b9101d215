//! Infrastructure for the tallyd pipeline: the job store (Postgres and
//! an in-memory fake honouring the same contract) and process
//! configuration.

pub mod config;
pub mod store;

pub use config::{ConfigError, EngineConfig};
pub use store::{
    ClaimedJob, InMemoryJobStore, JobStore, PgJobStore, StoreError, SubmitOutcome,
};

/// Embedded schema migrations for the three ingestion tables.
///
/// Applied on startup when `RUN_MIGRATIONS_ON_STARTUP=true`.
pub static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
