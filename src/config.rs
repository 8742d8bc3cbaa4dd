use std::path::PathBuf;

use anyhow::Context;

/// Process-wide configuration, loaded once at startup from the environment.
///
/// Mirrors `routstr.core.settings` in the original service: every knob here
/// is read from an env var with the same name, with sats-denominated knobs
/// converted to msat (`×1000`) at load time so the rest of the crate never
/// has to think in sats.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub upstream_api_key: Option<String>,

    pub model_based_pricing: bool,
    pub cost_per_request_msat: u64,
    pub cost_per_1k_input_msat: u64,
    pub cost_per_1k_output_msat: u64,

    pub exchange_fee: f64,
    pub chat_completions_api_version: Option<String>,
    pub price_tolerance_percent: u8,

    pub database_url: Option<String>,
    pub models_path: PathBuf,
    pub cashu_mint_url: String,

    pub host: String,
    pub port: u16,

    pub log_level: String,
    pub log_format: String,
}

const DEFAULT_TOLERANCE_PERCENT: u8 = 1;
const DEFAULT_EXCHANGE_FEE: f64 = 1.005;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .context("UPSTREAM_BASE_URL environment variable is required")?;

        let cost_per_request_sats: u64 = env_parse_or("COST_PER_REQUEST", 1)?;
        let cost_per_1k_input_sats: u64 = env_parse_or("COST_PER_1K_INPUT_TOKENS", 0)?;
        let cost_per_1k_output_sats: u64 = env_parse_or("COST_PER_1K_OUTPUT_TOKENS", 0)?;

        Ok(Self {
            upstream_base_url,
            upstream_api_key: non_empty_env("UPSTREAM_API_KEY"),

            model_based_pricing: env_bool("MODEL_BASED_PRICING", false),
            cost_per_request_msat: cost_per_request_sats * 1000,
            cost_per_1k_input_msat: cost_per_1k_input_sats * 1000,
            cost_per_1k_output_msat: cost_per_1k_output_sats * 1000,

            exchange_fee: env_parse_or("EXCHANGE_FEE", DEFAULT_EXCHANGE_FEE)?,
            chat_completions_api_version: non_empty_env("CHAT_COMPLETIONS_API_VERSION"),
            price_tolerance_percent: env_parse_or(
                "PRICE_TOLERANCE_PERCENT",
                DEFAULT_TOLERANCE_PERCENT,
            )?,

            database_url: non_empty_env("DATABASE_URL"),
            models_path: resolve_models_path(),
            cashu_mint_url: std::env::var("CASHU_MINT_URL")
                .unwrap_or_else(|_| "https://mint.minibits.cash/Bitcoin".into()),

            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse_or("PORT", 8080u16)?,

            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".into()),
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn resolve_models_path() -> PathBuf {
    let configured = std::env::var("MODELS_PATH").unwrap_or_else(|_| "models.json".into());
    let path = PathBuf::from(&configured);
    if path.exists() {
        return path;
    }
    let fallback = PathBuf::from("models.example.json");
    if configured == "models.json" && fallback.exists() {
        return fallback;
    }
    path
}
