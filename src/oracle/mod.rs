//! Price Oracle: aggregates BTC/USD spot across three public exchanges
//! and exposes a conservative (max, fee-padded) msat-per-USD rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tracing::{error, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    btc_usd_ask: f64,
}

/// Aggregated BTC/USD ask price. Holds the last successful value so a
/// total fetch failure degrades to staleness rather than an error.
pub struct PriceOracle {
    client: reqwest::Client,
    exchange_fee: f64,
    snapshot: RwLock<Option<Snapshot>>,
    stale: AtomicBool,
}

impl PriceOracle {
    pub fn new(exchange_fee: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            exchange_fee,
            snapshot: RwLock::new(None),
            stale: AtomicBool::new(true),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn btc_usd_ask(&self) -> f64 {
        self.snapshot
            .read()
            .expect("oracle snapshot lock poisoned")
            .map(|s| s.btc_usd_ask)
            .unwrap_or(0.0)
    }

    pub fn sats_usd_ask(&self) -> f64 {
        self.btc_usd_ask() / 100_000_000.0
    }

    /// Fan out the three exchange fetches concurrently, each under its own
    /// timeout; tolerate partial failure, fail hard (keep prior snapshot,
    /// flag staleness) only if all three fail.
    pub async fn tick(&self) {
        let (kraken, coinbase, binance) = tokio::join!(
            fetch_with_timeout(kraken_btc_usd(&self.client)),
            fetch_with_timeout(coinbase_btc_usd(&self.client)),
            fetch_with_timeout(binance_btc_usdt(&self.client)),
        );

        let prices: Vec<f64> = [kraken, coinbase, binance]
            .into_iter()
            .filter_map(|r| match r {
                Ok(Some(v)) => Some(v),
                Ok(None) => {
                    warn!("price oracle source timed out");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "price oracle source failed");
                    None
                }
            })
            .collect();

        if prices.is_empty() {
            error!("all price oracle sources failed, keeping last snapshot");
            self.stale.store(true, Ordering::Relaxed);
            return;
        }

        let ask = prices.iter().cloned().fold(f64::MIN, f64::max) * self.exchange_fee;
        *self.snapshot.write().expect("oracle snapshot lock poisoned") = Some(Snapshot { btc_usd_ask: ask });
        self.stale.store(false, Ordering::Relaxed);
    }

    /// Spawn the 10s polling loop, exiting promptly on shutdown.
    pub fn spawn_polling_task(
        self: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.tick().await;
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

async fn fetch_with_timeout(
    fut: impl std::future::Future<Output = anyhow::Result<f64>>,
) -> anyhow::Result<Option<f64>> {
    match tokio::time::timeout(FETCH_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(Some(v)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

async fn kraken_btc_usd(client: &reqwest::Client) -> anyhow::Result<f64> {
    let url = "https://api.kraken.com/0/public/Ticker?pair=XBTUSD";
    let body: serde_json::Value = client.get(url).send().await?.json().await?;
    let raw = body["result"]["XXBTZUSD"]["c"][0]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("unexpected kraken response shape"))?;
    Ok(raw.parse()?)
}

async fn coinbase_btc_usd(client: &reqwest::Client) -> anyhow::Result<f64> {
    let url = "https://api.coinbase.com/v2/prices/BTC-USD/spot";
    let body: serde_json::Value = client.get(url).send().await?.json().await?;
    let raw = body["data"]["amount"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("unexpected coinbase response shape"))?;
    Ok(raw.parse()?)
}

async fn binance_btc_usdt(client: &reqwest::Client) -> anyhow::Result<f64> {
    let url = "https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT";
    let body: serde_json::Value = client.get(url).send().await?.json().await?;
    let raw = body["price"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("unexpected binance response shape"))?;
    Ok(raw.parse()?)
}
