use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::admission::{SharedLedger, SharedWallet};
use crate::catalogue::ModelCatalogue;
use crate::config::Config;
use crate::oracle::PriceOracle;

/// Process-wide collaborators, held behind `Arc` and passed by reference
/// rather than as true globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalogue: Arc<ModelCatalogue>,
    pub oracle: Arc<PriceOracle>,
    pub ledger: SharedLedger,
    pub wallet: SharedWallet,
    pub http_client: reqwest::Client,
    pub metrics: PrometheusHandle,
}
