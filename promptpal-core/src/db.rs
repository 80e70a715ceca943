use crate::config::DatabaseConfig;
use crate::error::PromptPalError;
use sqlx::{postgres::PgPoolOptions, PgPool};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Create any missing tables and indexes. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::debug!("database schema ensured");
    Ok(())
}

/// Open the pool and bring the schema up to date.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, PromptPalError> {
    let pool = create_pool(config).await?;
    ensure_schema(&pool).await?;
    tracing::info!(max_connections = config.max_connections, "connected to PostgreSQL");
    Ok(pool)
}
