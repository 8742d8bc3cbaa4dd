//! Library entry point: exposes the pricing core and its ambient stack as
//! a crate so integration tests can build the router without a bound
//! socket, and so `main.rs` stays a thin process bootstrap.

pub mod admission;
pub mod api;
pub mod catalogue;
pub mod config;
pub mod cost;
pub mod credential;
pub mod db;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod oracle;
pub mod proxy;
pub mod settlement;
pub mod state;
pub mod usage;
pub mod wallet;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use catalogue::ModelCatalogue;
use config::Config;
use oracle::PriceOracle;
use state::AppState;
use wallet::CashuWalletClient;

/// Build the process-wide collaborators from config, without starting any
/// background tasks or binding a listener. Callers (main, or tests) decide
/// whether and how to spawn the refresh loops.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let pool = db::init_pool(config.database_url.as_deref()).await?;
    let ledger = db::ledger_from_pool(pool);

    let catalogue = Arc::new(ModelCatalogue::load_from_path(&config.models_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load models file, starting with empty catalogue");
        ModelCatalogue::empty()
    }));

    let oracle = Arc::new(PriceOracle::new(config.exchange_fee));
    let wallet: admission::SharedWallet = Arc::new(CashuWalletClient::new(config.cashu_mint_url.clone()));

    Ok(AppState {
        config: Arc::new(config),
        catalogue,
        oracle,
        ledger,
        wallet,
        http_client: reqwest::Client::new(),
        metrics: install_metrics(),
    })
}

/// Wire the full route table onto a prepared `AppState`. Shared by `main`
/// and integration tests so route wiring never drifts between the two.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/v1/models", get(api::list_models))
        .route("/v1/*path", post(proxy::proxy_handler))
        .route("/*path", post(proxy::proxy_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn install_metrics() -> PrometheusHandle {
    PrometheusBuilder::new().install_recorder().unwrap_or_else(|_| {
        // A global recorder is already installed (e.g. a prior test in the
        // same process); fall back to an unregistered handle so callers
        // still get a working `.render()`.
        PrometheusBuilder::new().build_recorder().handle()
    })
}
