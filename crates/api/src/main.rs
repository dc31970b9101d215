use std::sync::Arc;

use sqlx::PgPool;

use tallyd_infra::{EngineConfig, JobStore, PgJobStore, MIGRATIONS};

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

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool, config.stale_lock_timeout));
    let app = tallyd_api::app::build_app(store);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .expect("failed to bind 0.0.0.0:8080");

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
