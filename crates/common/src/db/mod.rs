//! Postgres access for generation jobs, attempts and study cards
//!
//! Job rows are read and written on the primary only: the orchestrator's
//! conditional status updates must see their own writes. The optional replica
//! serves existing-card lookups, which tolerate lag.

pub mod models;
mod repository;

pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct DbPool {
    primary: DatabaseConnection,
    card_replica: Option<DatabaseConnection>,
}

impl DbPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let primary = connect("primary", &config.url, config).await?;
        let card_replica = match config.read_url.as_deref() {
            Some(url) => Some(connect("card replica", url, config).await?),
            None => None,
        };

        info!(replica = card_replica.is_some(), "Database connections established");
        Ok(Self {
            primary,
            card_replica,
        })
    }

    /// Connection for job state and every write
    pub fn primary(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Connection for existing-card lookups
    pub fn card_reads(&self) -> &DatabaseConnection {
        self.card_replica.as_ref().unwrap_or(&self.primary)
    }

    /// Round-trip both connections
    pub async fn ping(&self) -> Result<()> {
        ping("primary", &self.primary).await?;
        if let Some(replica) = &self.card_replica {
            ping("card replica", replica).await?;
        }
        Ok(())
    }
}

fn connect_options(url: &str, config: &DatabaseConfig) -> ConnectOptions {
    let mut options = ConnectOptions::new(url);
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .sqlx_logging(false);
    options
}

async fn connect(role: &str, url: &str, config: &DatabaseConfig) -> Result<DatabaseConnection> {
    info!(role, "Connecting to database...");
    Database::connect(connect_options(url, config))
        .await
        .map_err(|e| AppError::DatabaseConnection {
            message: format!("{} connection failed: {}", role, e),
        })
}

async fn ping(role: &str, conn: &DatabaseConnection) -> Result<()> {
    conn.execute_unprepared("SELECT 1")
        .await
        .map(|_| ())
        .map_err(|e| AppError::DatabaseConnection {
            message: format!("{} ping failed: {}", role, e),
        })
}
