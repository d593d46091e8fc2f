use anyhow::{anyhow, Result};
use diesel::Connection;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const CONNECT_ATTEMPTS: u32 = 5;

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Setting up database connection pool");
    tracing::info!("Database URL: {}", mask_database_url(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);

    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    tracing::info!("Database connection pool created, testing connection...");

    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        tracing::info!("Connection attempt {} of {}", attempt, CONNECT_ATTEMPTS);

        match tokio::time::timeout(Duration::from_secs(15), pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Database connection established successfully!");
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => {
                tracing::warn!("Database connection failed on attempt {}: {}", attempt, e);
                last_error = Some(anyhow!("Database connection failed: {}", e));
            }
            Err(_) => {
                tracing::warn!("Database connection timed out on attempt {}", attempt);
                last_error = Some(anyhow!("Database connection timed out"));
            }
        }

        if attempt < CONNECT_ATTEMPTS {
            let wait_time = Duration::from_secs(2_u64.pow(attempt - 1));
            tracing::info!("Waiting {:?} before retry...", wait_time);
            tokio::time::sleep(wait_time).await;
        }
    }

    tracing::error!("All database connection attempts failed");
    Err(last_error.unwrap_or_else(|| {
        anyhow!("Failed to establish database connection after {} attempts", CONNECT_ATTEMPTS)
    }))
}

/// Applies pending embedded migrations on a dedicated blocking connection.
pub async fn run_migrations(config: &DatabaseConfig) -> Result<()> {
    let url = config.url.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&url)
            .map_err(|e| anyhow!("Failed to connect for migrations: {}", e))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow!("Failed to run migrations: {}", e))?;
        for version in applied {
            tracing::info!("Applied migration {}", version);
        }
        Ok(())
    })
    .await
    .map_err(|e| anyhow!("Migration task panicked: {}", e))?
}

fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let (before_at, after_at) = url.split_at(at_pos);
        if let Some(colon_pos) = before_at.rfind(':') {
            let (protocol_user, _password) = before_at.split_at(colon_pos);
            format!("{}:****{}", protocol_user, after_at)
        } else {
            "postgres://****@****".to_string()
        }
    } else {
        "Invalid URL format".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_database_url() {
        assert_eq!(
            mask_database_url("postgres://postgres:secret@db:5432/counsel"),
            "postgres://postgres:****@db:5432/counsel"
        );
        assert_eq!(mask_database_url("not a url"), "Invalid URL format");
    }
}
