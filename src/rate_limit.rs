//! Rate limiting for login attempts and catalog import jobs.
//!
//! There is no HTTP transport layer in scope, so the teacher's per-IP keying
//! is generalized to a generic string key (a username for the login limiter,
//! a commessa code for the import limiter). The governor-based global +
//! keyed limiter shape and the periodic cleanup task are otherwise unchanged.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::{collections::HashMap, num::NonZeroU32, sync::Arc, time::Duration};
use tokio::sync::RwLock;

pub type GlobalRateLimiter = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;
pub type KeyedRateLimiter =
    Arc<RwLock<HashMap<String, Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>>>>;

#[derive(Clone)]
pub struct RateLimitConfig {
    /// Requests per second allowed globally across all keys.
    pub global_rps: u32,
    /// Requests per second allowed per key.
    pub per_key_rps: u32,
    pub global_burst: u32,
    pub key_burst: u32,
    pub cleanup_interval: Duration,
}

impl RateLimitConfig {
    /// Built from [`crate::config::RateLimitConfig`]'s login attempt budget:
    /// `attempts` per `window_seconds`, expressed as a per-second quota.
    pub fn for_login(attempts: u32, window_seconds: u64) -> Self {
        let rps = (attempts as f64 / window_seconds.max(1) as f64).ceil() as u32;
        Self {
            global_rps: rps.max(1) * 200,
            per_key_rps: rps.max(1),
            global_burst: attempts.max(1) * 20,
            key_burst: attempts.max(1),
            cleanup_interval: Duration::from_secs(300),
        }
    }

    /// Built from `import_rate_limit_per_minute`.
    pub fn for_import(per_minute: u32) -> Self {
        let rps = (per_minute as f64 / 60.0).ceil() as u32;
        Self {
            global_rps: rps.max(1) * 50,
            per_key_rps: rps.max(1),
            global_burst: per_minute.max(1),
            key_burst: per_minute.max(1),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

pub struct RateLimitService {
    global_limiter: GlobalRateLimiter,
    key_limiters: KeyedRateLimiter,
    config: RateLimitConfig,
}

impl RateLimitService {
    pub fn new(config: RateLimitConfig) -> Self {
        let global_quota = Quota::per_second(NonZeroU32::new(config.global_rps).unwrap())
            .allow_burst(NonZeroU32::new(config.global_burst).unwrap());
        let global_limiter = Arc::new(GovernorRateLimiter::direct(global_quota));

        let service = Self {
            global_limiter,
            key_limiters: Arc::new(RwLock::new(HashMap::new())),
            config,
        };

        service.start_cleanup_task();
        service
    }

    async fn get_key_limiter(
        &self,
        key: &str,
    ) -> Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>> {
        let mut limiters = self.key_limiters.write().await;

        if let Some(limiter) = limiters.get(key) {
            limiter.clone()
        } else {
            let quota = Quota::per_second(NonZeroU32::new(self.config.per_key_rps).unwrap())
                .allow_burst(NonZeroU32::new(self.config.key_burst).unwrap());
            let limiter = Arc::new(GovernorRateLimiter::direct(quota));
            limiters.insert(key.to_string(), limiter.clone());
            limiter
        }
    }

    pub async fn check(&self, key: &str) -> Result<(), RateLimitError> {
        if self.global_limiter.check().is_err() {
            return Err(RateLimitError::GlobalLimitExceeded);
        }

        let key_limiter = self.get_key_limiter(key).await;
        if key_limiter.check().is_err() {
            return Err(RateLimitError::KeyLimitExceeded {
                key: key.to_string(),
                retry_after: 1,
            });
        }

        Ok(())
    }

    fn start_cleanup_task(&self) {
        let limiters = self.key_limiters.clone();
        let interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;

                let mut write_guard = limiters.write().await;
                if write_guard.len() > 10000 {
                    let to_remove = write_guard.len() / 2;
                    let keys: Vec<_> = write_guard.keys().take(to_remove).cloned().collect();
                    for key in keys {
                        write_guard.remove(&key);
                    }
                    tracing::info!("Cleaned up {} rate limiters", to_remove);
                }
            }
        });
    }
}

#[derive(Debug)]
pub enum RateLimitError {
    GlobalLimitExceeded,
    KeyLimitExceeded { key: String, retry_after: u64 },
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitError::GlobalLimitExceeded => {
                write!(f, "global rate limit exceeded")
            }
            RateLimitError::KeyLimitExceeded { key, retry_after } => {
                write!(f, "rate limit exceeded for {key}, retry after {retry_after}s")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

impl From<RateLimitError> for crate::error::AppError {
    fn from(err: RateLimitError) -> Self {
        crate::error::AppError::TransientBackend(err.to_string())
    }
}

/// Holds the two named limiter instances spec §6 asks for as config surface.
pub struct RateLimiters {
    pub login: RateLimitService,
    pub import: RateLimitService,
}

impl RateLimiters {
    pub fn from_config(config: &crate::config::RateLimitConfig) -> Self {
        Self {
            login: RateLimitService::new(RateLimitConfig::for_login(
                config.login_rate_limit_attempts,
                config.login_rate_limit_window_seconds,
            )),
            import: RateLimitService::new(RateLimitConfig::for_import(
                config.import_rate_limit_per_minute,
            )),
        }
    }
}

#[allow(dead_code)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_rate_limiter_blocks_after_burst() {
        let config = RateLimitConfig {
            global_rps: 10,
            per_key_rps: 2,
            global_burst: 5,
            key_burst: 2,
            cleanup_interval: Duration::from_secs(60),
        };

        let service = RateLimitService::new(config);

        assert!(service.check("user1").await.is_ok());
        assert!(service.check("user1").await.is_ok());
    }

    #[tokio::test]
    async fn test_login_quota_from_config() {
        let config = RateLimitConfig::for_login(5, 60);
        assert!(config.per_key_rps >= 1);
    }

    #[tokio::test]
    async fn test_import_quota_from_config() {
        let config = RateLimitConfig::for_import(10);
        assert!(config.per_key_rps >= 1);
    }
}
