//! PostgreSQL pool and schema migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::QueueSettings;

/// Open a connection pool sized by the settings.
pub async fn connect(settings: &QueueSettings) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.database_url)
        .await?;
    info!(max_connections = settings.max_connections, "connected to postgres");
    Ok(pool)
}

/// Apply the embedded migrations (job queue, dead letters, sync tables).
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("migrations applied");
    Ok(())
}
