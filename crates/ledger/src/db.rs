use regsync_core::config::PostgresConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::LedgerError;

/// Create a PostgreSQL connection pool and run migrations.
pub async fn init_pg_pool(config: &PostgresConfig) -> Result<PgPool, LedgerError> {
    if !config.is_configured() {
        warn!("postgres not configured, falling back to defaults for {}", config.host);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.connection_string())
        .await?;
    info!("postgres connected: {}", config.host);

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("database migrations applied successfully");

    Ok(pool)
}
