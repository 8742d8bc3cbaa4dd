//! Wallet Client: opaque ecash custody. Redeems inbound Cashu tokens and
//! mints outbound refund tokens against a mint's NUT-00/NUT-03 HTTP API.
//! Token wire-format parsing follows the Cashu TokenV3 shape
//! (`cashuA<base64url-json>`).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

const TOKEN_PREFIX: &str = "cashuA";
const SEND_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Sat,
    Msat,
}

impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Sat => "sat",
            Unit::Msat => "msat",
        }
    }
}

/// A parsed, not-yet-redeemed Cashu token.
#[derive(Debug, Clone)]
pub struct CashuToken {
    pub raw: String,
    pub amount: u64,
    pub unit: Unit,
    pub mint_url: String,
}

impl CashuToken {
    pub fn amount_msat(&self) -> u64 {
        match self.unit {
            Unit::Msat => self.amount,
            Unit::Sat => self.amount * 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token already spent")]
    AlreadySpent,
    #[error("mint error: {0}")]
    MintError(String),
    #[error("failed to create refund after {attempts} attempts: {source}")]
    SendFailed { attempts: u32, source: String },
}

#[derive(Deserialize)]
struct TokenV3Envelope {
    token: Vec<TokenV3Entry>,
    unit: Option<String>,
}

#[derive(Deserialize)]
struct TokenV3Entry {
    mint: String,
    proofs: Vec<TokenV3Proof>,
}

#[derive(Deserialize)]
struct TokenV3Proof {
    amount: u64,
}

/// Parse a bearer Cashu token string into its `{amount, unit, mint_url}`
/// without contacting the mint. Redemption is a separate, authoritative
/// step — the redeemed amount, not the claimed amount, is used for
/// pre-authorisation.
pub fn parse_token(raw: &str) -> Result<CashuToken, WalletError> {
    let body = raw.strip_prefix(TOKEN_PREFIX).ok_or(WalletError::InvalidToken)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(body.trim_end_matches('='))
        .map_err(|_| WalletError::InvalidToken)?;
    let envelope: TokenV3Envelope =
        serde_json::from_slice(&decoded).map_err(|_| WalletError::InvalidToken)?;

    let entry = envelope.token.first().ok_or(WalletError::InvalidToken)?;
    let amount: u64 = entry.proofs.iter().map(|p| p.amount).sum();
    if amount == 0 {
        return Err(WalletError::InvalidToken);
    }
    let unit = match envelope.unit.as_deref() {
        Some("msat") => Unit::Msat,
        _ => Unit::Sat,
    };

    Ok(CashuToken {
        raw: raw.to_string(),
        amount,
        unit,
        mint_url: entry.mint.clone(),
    })
}

/// The three operations the rest of the pipeline needs from ecash custody.
#[async_trait]
pub trait WalletClient: Send + Sync {
    async fn receive(&self, token: &str) -> Result<(u64, Unit, String), WalletError>;
    async fn send(&self, amount: u64, unit: Unit, mint_url: Option<&str>) -> Result<String, WalletError>;
    async fn balance(&self) -> Result<u64, WalletError>;
}

/// HTTP-backed wallet client talking to a Cashu mint's redeem/mint endpoints.
pub struct CashuWalletClient {
    client: reqwest::Client,
    mint_url: String,
}

impl CashuWalletClient {
    pub fn new(mint_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            mint_url: mint_url.into(),
        }
    }
}

#[async_trait]
impl WalletClient for CashuWalletClient {
    async fn receive(&self, token: &str) -> Result<(u64, Unit, String), WalletError> {
        let parsed = parse_token(token)?;

        let response = self
            .client
            .post(format!("{}/v1/melt/cashu", parsed.mint_url))
            .json(&serde_json::json!({ "token": parsed.raw }))
            .send()
            .await
            .map_err(|e| WalletError::MintError(e.to_string()))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(WalletError::AlreadySpent);
        }
        if !response.status().is_success() {
            return Err(WalletError::MintError(format!(
                "mint responded with {}",
                response.status()
            )));
        }

        Ok((parsed.amount, parsed.unit, parsed.mint_url))
    }

    async fn send(&self, amount: u64, unit: Unit, mint_url: Option<&str>) -> Result<String, WalletError> {
        let mint_url = mint_url.unwrap_or(&self.mint_url).to_string();
        let mut last_error = String::new();

        for attempt in 1..=SEND_MAX_RETRIES {
            let result = self
                .client
                .post(format!("{mint_url}/v1/mint/cashu"))
                .json(&serde_json::json!({ "amount": amount, "unit": unit.as_str() }))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|body| body.get("token").and_then(|t| t.as_str()).map(String::from))
                        .ok_or_else(|| WalletError::MintError("mint returned no token".into()));
                }
                Ok(response) => {
                    last_error = format!("mint responded with {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            if attempt < SEND_MAX_RETRIES {
                warn!(attempt, "refund mint attempt failed, retrying immediately");
            }
        }

        error!(attempts = SEND_MAX_RETRIES, error = %last_error, "send_token exhausted retries");
        Err(WalletError::SendFailed {
            attempts: SEND_MAX_RETRIES,
            source: last_error,
        })
    }

    async fn balance(&self) -> Result<u64, WalletError> {
        let response = self
            .client
            .get(format!("{}/v1/balance", self.mint_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| WalletError::MintError(e.to_string()))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| WalletError::MintError(e.to_string()))?;
        body.get("balance")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| WalletError::MintError("malformed balance response".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_token(mint: &str, amounts: &[u64], unit: &str) -> String {
        let envelope = serde_json::json!({
            "token": [{
                "mint": mint,
                "proofs": amounts.iter().map(|a| serde_json::json!({"amount": a, "secret": "s", "C": "c"})).collect::<Vec<_>>(),
            }],
            "unit": unit,
        });
        format!(
            "{TOKEN_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope).unwrap())
        )
    }

    #[test]
    fn parses_valid_token() {
        let token = encode_token("https://mint.example", &[10, 20], "sat");
        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.amount, 30);
        assert_eq!(parsed.unit, Unit::Sat);
        assert_eq!(parsed.mint_url, "https://mint.example");
        assert_eq!(parsed.amount_msat(), 30_000);
    }

    #[test]
    fn msat_unit_amount_msat_is_identity() {
        let token = encode_token("https://mint.example", &[500], "msat");
        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.amount_msat(), 500);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(matches!(parse_token("garbage"), Err(WalletError::InvalidToken)));
    }

    #[test]
    fn rejects_malformed_payload() {
        let bogus = format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(b"not json"));
        assert!(matches!(parse_token(&bogus), Err(WalletError::InvalidToken)));
    }

    #[test]
    fn rejects_zero_amount_token() {
        let token = encode_token("https://mint.example", &[], "sat");
        assert!(matches!(parse_token(&token), Err(WalletError::InvalidToken)));
    }
}
