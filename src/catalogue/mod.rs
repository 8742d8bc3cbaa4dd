//! Model Catalogue: loads model descriptors from a JSON file and
//! keeps their sats-denominated pricing fresh against the Price Oracle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::oracle::PriceOracle;

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Fallback context/completion sizes used when a model carries no
/// `top_provider` limits.
const FALLBACK_PROMPT_TOKENS: f64 = 1_048_576.0;
const FALLBACK_COMPLETION_TOKENS: f64 = 32_000.0;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Architecture {
    pub modality: Option<String>,
    #[serde(default)]
    pub input_modalities: Vec<String>,
    #[serde(default)]
    pub output_modalities: Vec<String>,
    pub tokenizer: Option<String>,
    pub instruct_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
    #[serde(default)]
    pub request: f64,
    #[serde(default)]
    pub image: f64,
    #[serde(default)]
    pub web_search: f64,
    #[serde(default)]
    pub internal_reasoning: f64,
    #[serde(default)]
    pub max_cost: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TopProvider {
    pub context_length: Option<u64>,
    pub max_completion_tokens: Option<u64>,
    pub is_moderated: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub description: String,
    pub context_length: u64,
    #[serde(default)]
    pub architecture: Architecture,
    pub pricing: Pricing,
    pub sats_pricing: Option<Pricing>,
    #[serde(default)]
    pub per_request_limits: Option<serde_json::Value>,
    pub top_provider: Option<TopProvider>,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<ModelDescriptor>,
}

/// Read-many/write-one snapshot of the catalogue. Readers take a clone of
/// the `Arc` under `load()`, so a concurrent refresh swap never yields a
/// torn view (RCU-style snapshot swap).
pub struct ModelCatalogue {
    snapshot: ArcSwap<Vec<ModelDescriptor>>,
}

impl ModelCatalogue {
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read models file {:?}: {e}", path))?;
        let parsed: ModelsFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse models file {:?}: {e}", path))?;
        Ok(Self {
            snapshot: ArcSwap::from_pointee(parsed.models),
        })
    }

    pub fn empty() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn from_descriptors(descriptors: Vec<ModelDescriptor>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(descriptors),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<ModelDescriptor>> {
        self.snapshot.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    pub fn find(&self, id: &str) -> Option<ModelDescriptor> {
        self.snapshot.load().iter().find(|m| m.id == id).cloned()
    }

    /// Rebuild the whole descriptor list against the current sats/USD rate
    /// and atomically swap it in. Never partially mutates an existing entry.
    fn refresh(&self, sats_usd_ask: f64) {
        if sats_usd_ask <= 0.0 {
            warn!("refusing catalogue refresh with non-positive sats/usd rate");
            return;
        }
        let current = self.snapshot.load();
        let rebuilt: Vec<ModelDescriptor> = current
            .iter()
            .cloned()
            .map(|mut model| {
                model.sats_pricing = Some(derive_sats_pricing(&model.pricing, sats_usd_ask, model.top_provider));
                model
            })
            .collect();
        self.snapshot.store(Arc::new(rebuilt));
        debug!(models = current.len(), "catalogue pricing refreshed");
    }
}

/// Compute a model's sats-denominated pricing block, including `max_cost`,
/// from its dollar pricing and the current sats/USD conversion rate.
fn derive_sats_pricing(dollar: &Pricing, sats_usd_ask: f64, top_provider: Option<TopProvider>) -> Pricing {
    let mut sats = Pricing {
        prompt: dollar.prompt / sats_usd_ask,
        completion: dollar.completion / sats_usd_ask,
        request: dollar.request / sats_usd_ask,
        image: dollar.image / sats_usd_ask,
        web_search: dollar.web_search / sats_usd_ask,
        internal_reasoning: dollar.internal_reasoning / sats_usd_ask,
        max_cost: 0.0,
    };

    sats.max_cost = match top_provider {
        Some(tp) => match (tp.context_length, tp.max_completion_tokens) {
            (Some(ctx), Some(max_completion)) => {
                ctx as f64 * sats.prompt + max_completion as f64 * sats.completion
            }
            (Some(ctx), None) => ctx as f64 * sats.prompt + FALLBACK_COMPLETION_TOKENS * sats.completion,
            (None, Some(max_completion)) => {
                FALLBACK_PROMPT_TOKENS * sats.prompt + max_completion as f64 * sats.completion
            }
            (None, None) => {
                FALLBACK_PROMPT_TOKENS * sats.prompt + FALLBACK_COMPLETION_TOKENS * sats.completion
            }
        },
        None => {
            sats.prompt * FALLBACK_PROMPT_TOKENS
                + sats.completion * FALLBACK_COMPLETION_TOKENS
                + sats.request * 100_000.0
                + sats.image * 100.0
                + sats.web_search * 1_000.0
                + sats.internal_reasoning * 100.0
        }
    };

    sats
}

/// Spawn the 10s refresh loop. Cancellation-safe: the returned
/// `watch::Sender` closing (dropping the guard) or the shutdown signal
/// firing stops the loop cleanly between iterations, never mid-swap.
pub fn spawn_refresh_task(
    catalogue: Arc<ModelCatalogue>,
    oracle: Arc<PriceOracle>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let rate = oracle.sats_usd_ask();
                    catalogue.refresh(rate);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("catalogue refresh task shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Test-only helpers reused by other modules' unit tests (cost calculator,
/// admission) to build a catalogue without reading a models.json file.
#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn descriptor_with_sats_pricing(id: &str, sats_pricing: Pricing) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            created: 0,
            description: String::new(),
            context_length: 8192,
            architecture: Architecture::default(),
            pricing: Pricing::default(),
            sats_pricing: Some(sats_pricing),
            per_request_limits: None,
            top_provider: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(top_provider: Option<TopProvider>) -> ModelDescriptor {
        ModelDescriptor {
            id: "gpt-4".into(),
            name: "GPT-4".into(),
            created: 0,
            description: String::new(),
            context_length: 8192,
            architecture: Architecture::default(),
            pricing: Pricing {
                prompt: 0.00003,
                completion: 0.00006,
                request: 0.0,
                image: 0.0,
                web_search: 0.0,
                internal_reasoning: 0.0,
                max_cost: 0.0,
            },
            sats_pricing: None,
            per_request_limits: None,
            top_provider,
        }
    }

    #[test]
    fn max_cost_uses_top_provider_limits_when_present() {
        let model = descriptor(Some(TopProvider {
            context_length: Some(1000),
            max_completion_tokens: Some(500),
            is_moderated: None,
        }));
        let sats = derive_sats_pricing(&model.pricing, 100.0, model.top_provider);
        let expected = 1000.0 * (model.pricing.prompt / 100.0) + 500.0 * (model.pricing.completion / 100.0);
        assert!((sats.max_cost - expected).abs() < 1e-9);
    }

    #[test]
    fn max_cost_falls_back_without_top_provider() {
        let model = descriptor(None);
        let sats = derive_sats_pricing(&model.pricing, 100.0, model.top_provider);
        assert!(sats.max_cost > 0.0);
    }

    #[test]
    fn invariant_max_cost_positive_iff_dollar_pricing_positive() {
        let mut model = descriptor(None);
        model.pricing.prompt = 0.0;
        model.pricing.completion = 0.0;
        let sats = derive_sats_pricing(&model.pricing, 100.0, model.top_provider);
        assert_eq!(sats.max_cost, 0.0);
    }

    #[test]
    fn catalogue_refresh_swaps_whole_snapshot() {
        let catalogue = ModelCatalogue {
            snapshot: ArcSwap::from_pointee(vec![descriptor(None)]),
        };
        catalogue.refresh(100.0);
        let snap = catalogue.snapshot();
        assert!(snap[0].sats_pricing.is_some());
    }
}
