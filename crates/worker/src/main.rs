use std::sync::Arc;

use sqlx::PgPool;

use tallyd_infra::{EngineConfig, PgJobStore, MIGRATIONS};
use tallyd_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() {
    tallyd_observability::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let pool = match PgPool::connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to Postgres");
            std::process::exit(1);
        }
    };

    if config.run_migrations_on_startup {
        if let Err(e) = MIGRATIONS.run(&pool).await {
            tracing::error!(error = %e, "failed to apply migrations");
            std::process::exit(1);
        }
        tracing::info!("migrations applied");
    }

    let store = Arc::new(PgJobStore::new(pool, config.stale_lock_timeout));
    let worker_config = WorkerConfig::from_engine(&config);
    tracing::info!(
        concurrency = worker_config.concurrency,
        poll_secs = worker_config.poll_interval.as_secs(),
        "starting worker loops"
    );

    let handle = Worker::new(store, worker_config).spawn();
    let mut fatal = handle.fatal();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = fatal.changed() => {
            tracing::error!("fatal store error; shutting down");
            handle.shutdown().await;
            std::process::exit(1);
        }
    }

    handle.shutdown().await;
}
