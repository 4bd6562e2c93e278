//! Redis-backed ambient cache — non-core memoization (e.g. catalog search
//! results). Distinct from [`crate::analysis_cache`], which is the in-process,
//! version-checked cache spec §4.6 requires and which must never go through a
//! shared network cache (spec §6: "in-memory only; no externally visible
//! interface").

use anyhow::Result;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub default_ttl: u64,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            default_ttl: 300,
            enabled: true,
        }
    }
}

pub struct CacheService {
    client: Option<Client>,
    config: CacheConfig,
    connection_pool: Arc<RwLock<Vec<redis::aio::Connection>>>,
    stats: Arc<RwLock<CacheStats>>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

impl CacheService {
    pub async fn new(config: CacheConfig) -> Result<Self> {
        if !config.enabled {
            info!("Cache service disabled");
            return Ok(Self {
                client: None,
                config,
                connection_pool: Arc::new(RwLock::new(Vec::new())),
                stats: Arc::new(RwLock::new(CacheStats::default())),
            });
        }

        info!("Connecting to Redis at: {}", config.redis_url);
        let client = match Client::open(config.redis_url.clone()) {
            Ok(client) => match client.get_async_connection().await {
                Ok(_) => {
                    info!("Successfully connected to Redis");
                    Some(client)
                }
                Err(e) => {
                    warn!("Failed to connect to Redis: {}. Cache disabled.", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to create Redis client: {}. Cache disabled.", e);
                None
            }
        };

        Ok(Self {
            client,
            config,
            connection_pool: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::Connection> {
        if let Some(client) = &self.client {
            {
                let mut pool = self.connection_pool.write().await;
                if let Some(conn) = pool.pop() {
                    return Ok(conn);
                }
            }
            client.get_async_connection().await.map_err(|e| {
                error!("Failed to get Redis connection: {}", e);
                e.into()
            })
        } else {
            Err(anyhow::anyhow!("Redis client not available"))
        }
    }

    async fn return_connection(&self, conn: redis::aio::Connection) {
        let mut pool = self.connection_pool.write().await;
        if pool.len() < 10 {
            pool.push(conn);
        }
    }

    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if self.client.is_none() {
            return None;
        }
        debug!("Cache GET: {}", key);
        match self.get_connection().await {
            Ok(mut conn) => match conn.get::<_, String>(key).await {
                Ok(data) => match serde_json::from_str::<T>(&data) {
                    Ok(value) => {
                        self.increment_hits().await;
                        self.return_connection(conn).await;
                        Some(value)
                    }
                    Err(e) => {
                        warn!("Failed to deserialize cached value for key {}: {}", key, e);
                        self.increment_errors().await;
                        self.return_connection(conn).await;
                        None
                    }
                },
                Err(_) => {
                    self.increment_misses().await;
                    self.return_connection(conn).await;
                    None
                }
            },
            Err(e) => {
                error!("Failed to get cache connection: {}", e);
                self.increment_errors().await;
                None
            }
        }
    }

    pub async fn set<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> Result<()>
    where
        T: Serialize,
    {
        if self.client.is_none() {
            return Ok(());
        }
        let data = serde_json::to_string(value)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        match self.get_connection().await {
            Ok(mut conn) => match conn.set_ex::<_, _, ()>(key, data, ttl).await {
                Ok(_) => {
                    self.increment_sets().await;
                    self.return_connection(conn).await;
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to set cache value for key {}: {}", key, e);
                    self.increment_errors().await;
                    self.return_connection(conn).await;
                    Err(e.into())
                }
            },
            Err(e) => {
                self.increment_errors().await;
                Err(e)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        if self.client.is_none() {
            return Ok(());
        }
        match self.get_connection().await {
            Ok(mut conn) => {
                conn.del::<_, ()>(key).await.map_err(anyhow::Error::from)?;
                self.return_connection(conn).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_stats(&self) -> CacheStats {
        let mut stats = self.stats.read().await.clone();
        stats.calculate_hit_rate();
        stats
    }

    pub async fn health_check(&self) -> bool {
        if self.client.is_none() {
            return false;
        }
        matches!(self.get_connection().await, Ok(_))
    }

    async fn increment_hits(&self) {
        self.stats.write().await.hits += 1;
    }
    async fn increment_misses(&self) {
        self.stats.write().await.misses += 1;
    }
    async fn increment_errors(&self) {
        self.stats.write().await.errors += 1;
    }
    async fn increment_sets(&self) {
        self.stats.write().await.sets += 1;
    }
}

/// Cache key builder for the ambient (non-core) cache.
pub struct CacheKey;

impl CacheKey {
    pub fn catalog_search(commessa_id: i64, query: &str) -> String {
        format!(
            "catalog:search:{}:{}",
            commessa_id,
            query.trim().to_lowercase().replace(' ', "_")
        )
    }

    pub fn wbs6_analysis(commessa_id: i64, round_number: Option<i32>) -> String {
        match round_number {
            Some(r) => format!("wbs6:{commessa_id}:round:{r}"),
            None => format!("wbs6:{commessa_id}:all"),
        }
    }

    pub fn trend_round(commessa_id: i64, impresa_id: Option<i64>) -> String {
        match impresa_id {
            Some(id) => format!("trend:{commessa_id}:impresa:{id}"),
            None => format!("trend:{commessa_id}:all"),
        }
    }
}

#[allow(dead_code)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cache_key_generation() {
        assert_eq!(CacheKey::wbs6_analysis(7, Some(2)), "wbs6:7:round:2");
        assert_eq!(
            CacheKey::catalog_search(7, "controsoffitto doppia lastra"),
            "catalog:search:7:controsoffitto_doppia_lastra"
        );
    }

    #[tokio::test]
    async fn test_cache_service_disabled() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = CacheService::new(config).await.unwrap();
        assert!(cache.client.is_none());
        let result = cache.set("test", &json!({"test": "value"}), None).await;
        assert!(result.is_ok());
        let value: Option<serde_json::Value> = cache.get("test").await;
        assert!(value.is_none());
    }
}
