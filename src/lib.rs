//! Construction Tender Reconciliation Engine
//!
//! The line-item alignment engine (C4), price-list catalog (C2) and
//! semantic search (C3/C9), analysis cache (C6) and WBS aggregation (C7/C8)
//! for reconciling project cost estimates against vendor return offers.
//! See `spec.md` / `SPEC_FULL.md` for the full component breakdown.

pub mod alignment;
pub mod analysis_cache;
pub mod bundle;
pub mod cache;
pub mod catalog;
pub mod catalog_search;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod nlp;
pub mod normalization;
pub mod rate_limit;
pub mod reconciliation;
pub mod response;
pub mod trends;
pub mod validation;
pub mod wbs_aggregation;

use std::sync::Arc;

use crate::analysis_cache::AnalysisCache;
use crate::cache::CacheService;
use crate::config::Config;
use crate::db::Database;
use crate::nlp::embedding::{EmbeddingConfig, EmbeddingService};
use crate::nlp::faiss_index::FaissIndexCache;
use crate::rate_limit::RateLimiters;

/// Shared services every request handler / import worker is built against.
/// Mirrors the teacher's `AppState` shape (one `Arc<Service>` field per
/// collaborator) but scoped to this engine's actual components instead of
/// the teacher's betting-platform services.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    pub cache: Arc<CacheService>,
    pub analysis_cache: Arc<AnalysisCache>,
    pub embedding_service: Arc<EmbeddingService>,
    pub faiss_index: Arc<FaissIndexCache>,
    pub rate_limiters: Arc<RateLimiters>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let database = Database::new((&config.database).into()).await?;
        let cache = CacheService::new(cache::CacheConfig {
            enabled: true,
            ..Default::default()
        })
        .await?;
        let embedding_service = EmbeddingService::new(EmbeddingConfig {
            model_id: config.nlp.model_id.clone(),
            max_length: config.nlp.max_length,
            batch_size: config.nlp.batch_size,
        });
        let faiss_index = FaissIndexCache::new(format!("{}/nlp/price_list", config.storage.storage_root));
        let rate_limiters = RateLimiters::from_config(&config.rate_limit);

        Ok(Self {
            config: Arc::new(config),
            database: Arc::new(database),
            cache: Arc::new(cache),
            analysis_cache: Arc::new(AnalysisCache::new()),
            embedding_service: Arc::new(embedding_service),
            faiss_index: Arc::new(faiss_index),
            rate_limiters: Arc::new(rate_limiters),
        })
    }
}
