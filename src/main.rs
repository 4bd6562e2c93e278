//! Construction Tender Reconciliation Engine — process entry point.
//!
//! HTTP transport, auth and RBAC are out of scope (spec §1): this binary
//! only wires up the ambient stack (config, tracing, DB pool, caches, rate
//! limiters) and exposes a `/health` endpoint, the way the teacher's
//! `main.rs` bootstraps its services before mounting routes.

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use tender_reconciliation_engine::{config::Config, AppState};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration validation failed: {e}"))?;

    let addr: std::net::SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    info!("initializing reconciliation engine services");
    let state = AppState::new(config).await?;

    let app = Router::new()
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.database.pool_status();
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "db_pool": {
            "size": pool.size,
            "available": pool.available,
        },
        "nlp_model_id": state.embedding_service.model_id(),
    }))
}
