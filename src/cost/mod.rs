//! Cost Calculator: converts extracted usage into the final msat charge,
//! using either the flat per-1K-token tariff or catalogue pricing.

use crate::catalogue::ModelCatalogue;
use crate::config::Config;
use crate::usage::Usage;

#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredCost {
    pub base_msat: u64,
    pub input_msat: u64,
    pub output_msat: u64,
    pub total_msat: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CostOutcome {
    /// No usage available, or token pricing disabled: charge the
    /// pre-authorised ceiling.
    MaxCost(MeasuredCost),
    /// Usage-derived charge.
    Measured(MeasuredCost),
    /// Catalogue miss while computing a final cost.
    Error { message: String, code: &'static str },
}

/// `max_cost_msat` is the pre-authorised ceiling from Pre-charge Admission,
/// reused here as the base/fallback cost.
pub fn calculate_cost(usage: Option<&Usage>, max_cost_msat: u64, config: &Config, catalogue: &ModelCatalogue) -> CostOutcome {
    let max_cost = MeasuredCost {
        base_msat: max_cost_msat,
        input_msat: 0,
        output_msat: 0,
        total_msat: max_cost_msat,
    };

    let Some(usage) = usage else {
        return CostOutcome::MaxCost(max_cost);
    };

    let (per_1k_input, per_1k_output) = if !config.model_based_pricing {
        (
            config.cost_per_1k_input_msat as f64,
            config.cost_per_1k_output_msat as f64,
        )
    } else if catalogue.is_empty() {
        (
            config.cost_per_1k_input_msat as f64,
            config.cost_per_1k_output_msat as f64,
        )
    } else {
        let Some(model) = catalogue.find(&usage.model) else {
            return CostOutcome::Error {
                message: format!("Invalid model in response: {}", usage.model),
                code: "model_not_found",
            };
        };
        let Some(sats_pricing) = model.sats_pricing else {
            return CostOutcome::Error {
                message: "Model pricing not defined".to_string(),
                code: "pricing_not_found",
            };
        };
        (
            sats_pricing.prompt * 1_000_000.0,
            sats_pricing.completion * 1_000_000.0,
        )
    };

    if per_1k_input == 0.0 || per_1k_output == 0.0 {
        return CostOutcome::MaxCost(max_cost);
    }

    let input_msat = round3(usage.prompt_tokens as f64 / 1000.0 * per_1k_input);
    let output_msat = round3(usage.completion_tokens as f64 / 1000.0 * per_1k_output);
    let total_msat = (input_msat + output_msat).ceil() as u64;

    CostOutcome::Measured(MeasuredCost {
        base_msat: 0,
        input_msat: input_msat as u64,
        output_msat: output_msat as u64,
        total_msat,
    })
}

/// Half-away-from-zero rounding to 3 decimal places, matching Python's
/// `round(x, 3)` for the non-negative msat quantities we deal with here.
fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Pricing, TopProvider};

    fn base_config() -> Config {
        Config {
            upstream_base_url: "https://upstream.example".into(),
            upstream_api_key: None,
            model_based_pricing: false,
            cost_per_request_msat: 1000,
            cost_per_1k_input_msat: 0,
            cost_per_1k_output_msat: 0,
            exchange_fee: 1.005,
            chat_completions_api_version: None,
            price_tolerance_percent: 1,
            database_url: None,
            models_path: "models.json".into(),
            cashu_mint_url: "https://mint.example".into(),
            host: "0.0.0.0".into(),
            port: 8080,
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }

    #[test]
    fn no_usage_returns_max_cost() {
        let catalogue = ModelCatalogue::empty();
        let outcome = calculate_cost(None, 1000, &base_config(), &catalogue);
        assert_eq!(outcome, CostOutcome::MaxCost(MeasuredCost { base_msat: 1000, input_msat: 0, output_msat: 0, total_msat: 1000 }));
    }

    #[test]
    fn flat_pricing_mode_computes_measured_cost() {
        let mut config = base_config();
        config.cost_per_1k_input_msat = 1000;
        config.cost_per_1k_output_msat = 2000;
        let catalogue = ModelCatalogue::empty();
        let usage = Usage { model: "x".into(), prompt_tokens: 1000, completion_tokens: 500 };

        let outcome = calculate_cost(Some(&usage), 50_000, &config, &catalogue);
        match outcome {
            CostOutcome::Measured(cost) => assert_eq!(cost.total_msat, 2000),
            other => panic!("expected measured cost, got {other:?}"),
        }
    }

    #[test]
    fn flat_pricing_zero_rate_falls_back_to_max_cost() {
        let config = base_config();
        let catalogue = ModelCatalogue::empty();
        let usage = Usage { model: "x".into(), prompt_tokens: 1000, completion_tokens: 500 };
        let outcome = calculate_cost(Some(&usage), 1000, &config, &catalogue);
        assert!(matches!(outcome, CostOutcome::MaxCost(_)));
    }

    #[test]
    fn model_based_pricing_with_empty_catalogue_falls_back_to_flat() {
        let mut config = base_config();
        config.model_based_pricing = true;
        let catalogue = ModelCatalogue::empty();
        let usage = Usage { model: "ghost".into(), prompt_tokens: 10, completion_tokens: 10 };
        let outcome = calculate_cost(Some(&usage), 1000, &config, &catalogue);
        assert!(matches!(outcome, CostOutcome::MaxCost(_)));
    }

    #[test]
    fn model_based_pricing_missing_model_in_nonempty_catalogue_is_error() {
        let mut config = base_config();
        config.model_based_pricing = true;
        let catalogue = ModelCatalogue::from_descriptors(vec![crate::catalogue::test_support::descriptor_with_sats_pricing(
            "gpt-4",
            Pricing { prompt: 0.001, completion: 0.002, ..Default::default() },
        )]);
        let usage = Usage { model: "ghost".into(), prompt_tokens: 10, completion_tokens: 10 };
        let outcome = calculate_cost(Some(&usage), 1000, &config, &catalogue);
        assert!(matches!(outcome, CostOutcome::Error { code: "model_not_found", .. }));
    }

    #[test]
    fn ceil_applies_to_sum_not_each_side() {
        let mut config = base_config();
        config.cost_per_1k_input_msat = 1;
        config.cost_per_1k_output_msat = 1;
        let catalogue = ModelCatalogue::empty();
        // 0.4 + 0.4 = 0.8msat summed, not ceil(0.4)+ceil(0.4)=2
        let usage = Usage { model: "x".into(), prompt_tokens: 400, completion_tokens: 400 };
        let outcome = calculate_cost(Some(&usage), 1000, &config, &catalogue);
        match outcome {
            CostOutcome::Measured(cost) => assert_eq!(cost.total_msat, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
        let _ = TopProvider::default();
        let _ = Pricing::default();
    }
}
