//! Pre-charge Admission: computes `max_cost_for_model` and verifies
//! the caller can cover it before any upstream call is made.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::catalogue::ModelCatalogue;
use crate::config::Config;
use crate::credential::Credential;
use crate::db::AccountLedger;
use crate::error::ProxyError;
use crate::wallet::{self, Unit, WalletClient};

/// The outcome of successful admission: how much was reserved, and what
/// rail-specific state settlement will need later.
#[derive(Debug, Clone)]
pub enum Admission {
    Account {
        hashed_key: String,
        pre_auth_msat: u64,
    },
    Cashu {
        pre_auth_msat: u64,
        unit: Unit,
        mint_url: String,
    },
}

impl Admission {
    pub fn pre_auth_msat(&self) -> u64 {
        match self {
            Admission::Account { pre_auth_msat, .. } => *pre_auth_msat,
            Admission::Cashu { pre_auth_msat, .. } => *pre_auth_msat,
        }
    }
}

/// Computes the pre-authorisation ceiling for a request.
pub fn max_cost_for_model(model: Option<&str>, config: &Config, catalogue: &ModelCatalogue) -> u64 {
    if !config.model_based_pricing || catalogue.is_empty() {
        return config.cost_per_request_msat;
    }
    let Some(model) = model else {
        return config.cost_per_request_msat;
    };
    let Some(descriptor) = catalogue.find(model) else {
        warn!(model, "model not found in catalogue, using flat tariff");
        return config.cost_per_request_msat;
    };
    let Some(sats_pricing) = descriptor.sats_pricing else {
        return config.cost_per_request_msat;
    };

    let tolerance = config.price_tolerance_percent as f64 / 100.0;
    let max_cost_msat = sats_pricing.max_cost * 1000.0 * (1.0 - tolerance);
    max_cost_msat.floor() as u64
}

/// Admit an Account-rail request: atomically ensure and debit balance.
pub async fn admit_account(
    hashed_key: &str,
    max_cost_msat: u64,
    model: Option<&str>,
    ledger: &dyn AccountLedger,
) -> Result<Admission, ProxyError> {
    match ledger.pre_charge(hashed_key, max_cost_msat).await {
        Ok(_) => Ok(Admission::Account {
            hashed_key: hashed_key.to_string(),
            pre_auth_msat: max_cost_msat,
        }),
        Err(ProxyError::InsufficientBalance { .. }) => Err(ProxyError::InsufficientBalance {
            amount_required_msat: max_cost_msat,
            model: model.map(str::to_string),
            cashu_rail: false,
        }),
        Err(other) => Err(other),
    }
}

/// Admit a Cashu-rail request: the token is redeemed now, and the
/// redeemed amount — not the claimed amount — becomes the authoritative
/// pre-authorisation.
pub async fn admit_cashu(
    token: &str,
    max_cost_msat: u64,
    model: Option<&str>,
    wallet: &dyn WalletClient,
) -> Result<Admission, ProxyError> {
    let parsed = wallet::parse_token(token).map_err(classify_wallet_error)?;
    let claimed_msat = parsed.amount_msat();
    if claimed_msat < max_cost_msat {
        return Err(ProxyError::InsufficientBalance {
            amount_required_msat: max_cost_msat,
            model: model.map(str::to_string),
            cashu_rail: true,
        });
    }

    let (amount, unit, mint_url) = wallet.receive(token).await.map_err(classify_wallet_error)?;
    debug!(amount, unit = unit.as_str(), "cashu token redeemed");

    Ok(Admission::Cashu {
        pre_auth_msat: match unit {
            Unit::Msat => amount,
            Unit::Sat => amount * 1000,
        },
        unit,
        mint_url,
    })
}

pub async fn admit(
    credential: Credential,
    model: Option<&str>,
    max_cost_msat: u64,
    ledger: &dyn AccountLedger,
    wallet: &dyn WalletClient,
) -> Result<Admission, ProxyError> {
    match credential {
        Credential::Account { hashed_key } => {
            admit_account(&hashed_key, max_cost_msat, model, ledger).await
        }
        Credential::Cashu { token } => admit_cashu(&token, max_cost_msat, model, wallet).await,
    }
}

fn classify_wallet_error(err: wallet::WalletError) -> ProxyError {
    match err {
        wallet::WalletError::InvalidToken => ProxyError::InvalidToken,
        wallet::WalletError::AlreadySpent => ProxyError::AlreadySpent,
        wallet::WalletError::MintError(msg) => ProxyError::MintError(msg),
        wallet::WalletError::SendFailed { source, .. } => ProxyError::SendTokenFailed(source),
    }
}

pub type SharedLedger = Arc<dyn AccountLedger>;
pub type SharedWallet = Arc<dyn WalletClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::test_support::descriptor_with_sats_pricing;
    use crate::catalogue::Pricing;
    use crate::db::InMemoryAccountLedger;

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
    fn flat_tariff_when_model_based_pricing_disabled() {
        let config = base_config();
        let catalogue = ModelCatalogue::empty();
        assert_eq!(max_cost_for_model(Some("gpt-4"), &config, &catalogue), 1000);
    }

    #[test]
    fn flat_tariff_when_model_absent_from_body() {
        let mut config = base_config();
        config.model_based_pricing = true;
        let catalogue = ModelCatalogue::from_descriptors(vec![descriptor_with_sats_pricing(
            "gpt-4",
            Pricing { max_cost: 5.0, ..Default::default() },
        )]);
        assert_eq!(max_cost_for_model(None, &config, &catalogue), 1000);
    }

    #[test]
    fn model_based_cost_applies_tolerance() {
        let mut config = base_config();
        config.model_based_pricing = true;
        config.price_tolerance_percent = 1;
        let catalogue = ModelCatalogue::from_descriptors(vec![descriptor_with_sats_pricing(
            "gpt-4",
            Pricing { max_cost: 5.0, ..Default::default() },
        )]);
        // 5 sats * 1000 * 0.99 = 4950 msat
        assert_eq!(max_cost_for_model(Some("gpt-4"), &config, &catalogue), 4950);
    }

    #[tokio::test]
    async fn account_rail_debits_balance_on_success() {
        let ledger = InMemoryAccountLedger::new();
        ledger.seed("abc", 5000).await;
        let admission = admit_account("abc", 1000, Some("x"), &ledger).await.unwrap();
        assert_eq!(admission.pre_auth_msat(), 1000);
    }

    #[tokio::test]
    async fn account_rail_insufficient_balance_is_402_shaped() {
        let ledger = InMemoryAccountLedger::new();
        ledger.seed("abc", 100).await;
        let err = admit_account("abc", 1000, Some("x"), &ledger).await.unwrap_err();
        match err {
            ProxyError::InsufficientBalance { cashu_rail, .. } => assert!(!cashu_rail),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
