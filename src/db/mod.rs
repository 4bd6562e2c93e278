//! PostgreSQL connection pooling and the transaction wrapper used by the
//! import/reconciliation flows (delete-then-reinsert needs atomicity).

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

pub mod models;
pub mod queries;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
}

impl From<&crate::config::DatabaseConfig> for DatabaseConfig {
    fn from(cfg: &crate::config::DatabaseConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            max_connections: cfg.max_connections,
            min_connections: cfg.min_connections,
            connection_timeout: Duration::from_secs(cfg.connection_timeout_secs),
        }
    }
}

pub struct Database {
    pub(crate) pool: deadpool_postgres::Pool,
}

impl Database {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let pg_config = config
            .url
            .parse::<tokio_postgres::Config>()
            .context("Failed to parse database URL")?;

        let manager_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };

        let manager =
            deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, manager_config);

        let pool = deadpool_postgres::Pool::builder(manager)
            .max_size(config.max_connections as usize)
            .runtime(deadpool_postgres::Runtime::Tokio1)
            .wait_timeout(Some(config.connection_timeout))
            .create_timeout(Some(config.connection_timeout))
            .recycle_timeout(Some(config.connection_timeout))
            .build()
            .context("Failed to create database pool")?;

        let _ = pool
            .get()
            .await
            .context("Failed to establish database connection")?;

        Ok(Self { pool })
    }

    pub async fn get_connection(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .context("Failed to get database connection from pool")
    }

    pub fn pool_status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size as u32,
            available: status.available as u32,
            waiting: status.waiting as u32,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub available: u32,
    pub waiting: u32,
}

/// Wraps a deadpool transaction so the delete-then-reinsert import flows
/// (wipe `VoceComputo` for a computo, rebuild from aligned rows) commit or
/// roll back atomically.
pub struct Transaction<'a> {
    txn: deadpool_postgres::Transaction<'a>,
}

impl<'a> Transaction<'a> {
    pub async fn begin(conn: &'a mut deadpool_postgres::Object) -> Result<Self> {
        let txn = conn.transaction().await.context("Failed to begin transaction")?;
        Ok(Self { txn })
    }

    pub async fn commit(self) -> Result<()> {
        self.txn.commit().await.context("Failed to commit transaction")
    }

    pub async fn rollback(self) -> Result<()> {
        self.txn.rollback().await.context("Failed to rollback transaction")
    }

    pub fn client(&self) -> &deadpool_postgres::Transaction<'a> {
        &self.txn
    }
}

#[allow(dead_code)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_app_config() {
        let app_config = crate::config::DatabaseConfig {
            url: "postgresql://localhost/test".to_string(),
            max_connections: 20,
            min_connections: 2,
            connection_timeout_secs: 10,
        };
        let db_config = DatabaseConfig::from(&app_config);
        assert_eq!(db_config.max_connections, 20);
        assert_eq!(db_config.connection_timeout, Duration::from_secs(10));
    }
}
