//! Settlement: reconciles the pre-authorised charge against the measured
//! cost, crediting the ledger or minting a Cashu refund token.

use tracing::{info, warn};

use crate::admission::Admission;
use crate::cost::{CostOutcome, MeasuredCost};
use crate::db::AccountLedger;
use crate::error::ProxyError;
use crate::wallet::{Unit, WalletClient};

/// Fixed processing fee (msat, in the token's own unit) deducted on a
/// Cashu-rail refund when the upstream call itself failed. Applies only
/// to the Cashu rail; account-rail emergencies restore the pre-auth in full.
const UPSTREAM_FAILURE_FEE: u64 = 60;

#[derive(Debug, Clone, Default)]
pub struct SettlementOutcome {
    pub refund_token: Option<String>,
    pub final_msat: u64,
}

/// Normal settlement path: a cost was computed (`MaxCost` or `Measured`)
/// for a successful upstream response.
pub async fn settle(
    admission: &Admission,
    outcome: &CostOutcome,
    ledger: &dyn AccountLedger,
    wallet: &dyn WalletClient,
) -> Result<SettlementOutcome, ProxyError> {
    let measured = match outcome {
        CostOutcome::MaxCost(cost) | CostOutcome::Measured(cost) => cost.clone(),
        CostOutcome::Error { message, code } => {
            return Err(ProxyError::ModelNotFound(format!("{code}: {message}")));
        }
    };

    match admission {
        Admission::Account { hashed_key, pre_auth_msat } => {
            settle_account(hashed_key, *pre_auth_msat, &measured, ledger).await
        }
        Admission::Cashu { pre_auth_msat, unit, mint_url } => {
            settle_cashu(*pre_auth_msat, *unit, mint_url, &measured, wallet).await
        }
    }
}

async fn settle_account(
    hashed_key: &str,
    pre_auth_msat: u64,
    cost: &MeasuredCost,
    ledger: &dyn AccountLedger,
) -> Result<SettlementOutcome, ProxyError> {
    ledger.settle(hashed_key, pre_auth_msat, cost.total_msat).await?;
    info!(hashed_key, final_msat = cost.total_msat, "account rail settled");
    Ok(SettlementOutcome {
        refund_token: None,
        final_msat: cost.total_msat,
    })
}

async fn settle_cashu(
    pre_auth_msat: u64,
    unit: Unit,
    mint_url: &str,
    cost: &MeasuredCost,
    wallet: &dyn WalletClient,
) -> Result<SettlementOutcome, ProxyError> {
    let refund_in_unit = refund_amount_in_unit(pre_auth_msat, cost.total_msat, unit);
    mint_refund_if_positive(refund_in_unit, unit, mint_url, wallet, cost.total_msat).await
}

/// Refund computed in the token's original unit:
/// msat → `pre_auth - total`; sat → `pre_auth - ceil(total/1000)`.
fn refund_amount_in_unit(pre_auth_msat: u64, total_msat: u64, unit: Unit) -> i64 {
    match unit {
        Unit::Msat => pre_auth_msat as i64 - total_msat as i64,
        Unit::Sat => {
            let pre_auth_sat = pre_auth_msat / 1000;
            let total_sat = (total_msat + 999) / 1000;
            pre_auth_sat as i64 - total_sat as i64
        }
    }
}

async fn mint_refund_if_positive(
    refund_in_unit: i64,
    unit: Unit,
    mint_url: &str,
    wallet: &dyn WalletClient,
    final_msat: u64,
) -> Result<SettlementOutcome, ProxyError> {
    if refund_in_unit <= 0 {
        return Ok(SettlementOutcome {
            refund_token: None,
            final_msat,
        });
    }

    let token = wallet
        .send(refund_in_unit as u64, unit, Some(mint_url))
        .await
        .map_err(|e| ProxyError::SendTokenFailed(e.to_string()))?;

    Ok(SettlementOutcome {
        refund_token: Some(token),
        final_msat,
    })
}

/// Upstream returned a non-2xx status: refund `pre_auth - 60` msat
/// (fixed processing fee, Cashu rail only) or restore the full pre-auth
/// on the account rail.
pub async fn settle_upstream_error(
    admission: &Admission,
    ledger: &dyn AccountLedger,
    wallet: &dyn WalletClient,
) -> Result<SettlementOutcome, ProxyError> {
    match admission {
        Admission::Account { hashed_key, pre_auth_msat } => {
            ledger.settle(hashed_key, *pre_auth_msat, 0).await?;
            warn!(hashed_key, "account rail restored in full after upstream error");
            Ok(SettlementOutcome::default())
        }
        Admission::Cashu { pre_auth_msat, unit, mint_url } => {
            let refund_in_unit = match unit {
                Unit::Msat => pre_auth_msat.saturating_sub(UPSTREAM_FAILURE_FEE),
                Unit::Sat => (pre_auth_msat / 1000).saturating_sub(UPSTREAM_FAILURE_FEE),
            };
            mint_refund_if_positive(refund_in_unit as i64, *unit, mint_url, wallet, 0).await
        }
    }
}

/// Emergency path: the response body could be neither JSON- nor
/// SSE-parsed. Restore/refund the full pre-authorisation; the original
/// upstream bytes are passed through unchanged by the caller.
pub async fn settle_emergency(
    admission: &Admission,
    ledger: &dyn AccountLedger,
    wallet: &dyn WalletClient,
) -> Result<SettlementOutcome, ProxyError> {
    match admission {
        Admission::Account { hashed_key, pre_auth_msat } => {
            ledger.settle(hashed_key, *pre_auth_msat, 0).await?;
            warn!(hashed_key, "account rail emergency refund issued");
            Ok(SettlementOutcome::default())
        }
        Admission::Cashu { pre_auth_msat, unit, mint_url } => {
            let refund_in_unit = match unit {
                Unit::Msat => *pre_auth_msat,
                Unit::Sat => pre_auth_msat / 1000,
            };
            mint_refund_if_positive(refund_in_unit as i64, *unit, mint_url, wallet, 0).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msat_refund_is_exact_difference() {
        assert_eq!(refund_amount_in_unit(10_000, 4_000, Unit::Msat), 6_000);
    }

    #[test]
    fn sat_refund_rounds_cost_up_before_subtracting() {
        // pre_auth 10 sat, cost 300 msat -> 1 sat ceil, refund 9 sat.
        assert_eq!(refund_amount_in_unit(10_000, 300, Unit::Sat), 9);
    }

    #[test]
    fn refund_never_negative_when_cost_exceeds_pre_auth() {
        assert!(refund_amount_in_unit(1_000, 5_000, Unit::Msat) < 0);
    }
}
