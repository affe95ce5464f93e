pub mod handlers;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::Store;
use crate::indexer::Controller;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub controller: Arc<Controller>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/chains", get(handlers::list_chains))
        .route("/api/v1/chains/{chain_id}/status", get(handlers::chain_status))
        .route("/api/v1/chains/{chain_id}/start", post(handlers::start_chain))
        .route("/api/v1/chains/{chain_id}/stop", post(handlers::stop_chain))
        .route("/api/v1/transfers", get(handlers::list_transfers))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(state: AppState, host: &str, port: u16) -> eyre::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
