//! In-process analysis cache (C6).
//!
//! Caches the WBS6/trend analysis payload computed for a commessa, keyed by a
//! version string derived from the row timestamps/ids the analysis actually
//! read. A cache hit requires both a version match and a fresh entry (5
//! minute TTL); anything else is a miss, and the caller recomputes. This
//! cache is in-memory only by design — it never goes through Redis or any
//! other shared store, unlike the ambient [`crate::cache::CacheService`].

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;

const TTL_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
struct AnalysisCacheEntry {
    version: String,
    timestamp: DateTime<Utc>,
    data: Value,
}

/// Inputs used to compute a dataset version for a commessa. Each is the max
/// updated_at (or id, where there's no updated_at column) across the rows
/// that feed the WBS6/trend analysis for that commessa.
#[derive(Debug, Clone, Default)]
pub struct DatasetVersionInputs {
    pub max_computo_updated_at: Option<DateTime<Utc>>,
    pub max_voce_computo_id: Option<i64>,
    pub max_offer_updated_at: Option<DateTime<Utc>>,
    pub max_price_item_updated_at: Option<DateTime<Utc>>,
}

/// Builds the version string from the four watermark values. Any missing
/// watermark contributes an empty segment rather than shifting the others,
/// so the pipe-joined shape stays stable across commesse with partial data.
pub fn compute_version(inputs: &DatasetVersionInputs) -> String {
    let parts = [
        inputs
            .max_computo_updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        inputs
            .max_voce_computo_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        inputs
            .max_offer_updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        inputs
            .max_price_item_updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    ];
    parts.join("|")
}

pub struct AnalysisCache {
    entries: DashMap<i64, AnalysisCacheEntry>,
    ttl: Duration,
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::minutes(TTL_MINUTES),
        }
    }

    /// Returns the cached payload only if the stored version matches and the
    /// entry hasn't aged past the TTL.
    pub fn try_get(&self, commessa_id: i64, version: &str) -> Option<Value> {
        let entry = self.entries.get(&commessa_id)?;
        if entry.version != version {
            return None;
        }
        if Utc::now() - entry.timestamp > self.ttl {
            return None;
        }
        Some(entry.data.clone())
    }

    pub fn store(&self, commessa_id: i64, version: String, data: Value) {
        self.entries.insert(
            commessa_id,
            AnalysisCacheEntry {
                version,
                timestamp: Utc::now(),
                data,
            },
        );
    }

    /// Explicit eviction. Used by the manual price-update path so a stale
    /// analysis can't be served while still inside the TTL window.
    pub fn invalidate(&self, commessa_id: i64) {
        self.entries.remove(&commessa_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_joins_four_parts() {
        let inputs = DatasetVersionInputs {
            max_voce_computo_id: Some(42),
            ..Default::default()
        };
        let version = compute_version(&inputs);
        assert_eq!(version, "|42||");
    }

    #[test]
    fn test_store_then_get_matching_version() {
        let cache = AnalysisCache::new();
        cache.store(7, "v1".to_string(), json!({"result": 1}));
        assert_eq!(cache.try_get(7, "v1"), Some(json!({"result": 1})));
    }

    #[test]
    fn test_get_misses_on_version_change() {
        let cache = AnalysisCache::new();
        cache.store(7, "v1".to_string(), json!({"result": 1}));
        assert_eq!(cache.try_get(7, "v2"), None);
    }

    #[test]
    fn test_invalidate_evicts_even_within_ttl() {
        let cache = AnalysisCache::new();
        cache.store(7, "v1".to_string(), json!({"result": 1}));
        cache.invalidate(7);
        assert_eq!(cache.try_get(7, "v1"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = AnalysisCache::new();
        cache.entries.insert(
            7,
            AnalysisCacheEntry {
                version: "v1".to_string(),
                timestamp: Utc::now() - Duration::minutes(TTL_MINUTES + 1),
                data: json!({}),
            },
        );
        assert_eq!(cache.try_get(7, "v1"), None);
    }
}
