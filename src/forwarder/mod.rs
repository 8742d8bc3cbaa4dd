//! Upstream Forwarder: builds, sends, and streams upstream requests,
//! sanitising headers so credentials and hop-by-hop framing never leak
//! onto the wire to the upstream API.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes as RawBytes;
use reqwest::header::{HeaderMap as ReqwestHeaderMap, HeaderName as ReqwestHeaderName, HeaderValue as ReqwestHeaderValue};
use tracing::{debug, warn};

use crate::config::Config;

/// Header names stripped from every outbound request, regardless of
/// configuration — never forwarded to upstream.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "refund-lnurl",
    "key-expiry-time",
    "x-cashu",
    "authorization",
];

/// Build the sanitised outbound header map for the upstream call.
pub fn sanitize_headers(inbound: &HeaderMap, config: &Config) -> ReqwestHeaderMap {
    let mut out = ReqwestHeaderMap::new();

    for (name, value) in inbound.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            ReqwestHeaderName::from_bytes(name.as_str().as_bytes()),
            ReqwestHeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }

    if let Some(upstream_key) = &config.upstream_api_key {
        if let Ok(value) = ReqwestHeaderValue::from_str(&format!("Bearer {upstream_key}")) {
            out.insert(reqwest::header::AUTHORIZATION, value);
        }
    }

    out
}

/// Strip a leading `v1/` path segment and resolve the upstream URL,
/// appending `api-version` for `chat/completions` when configured.
pub fn build_upstream_url(path: &str, query: &str, config: &Config) -> String {
    let path = path.strip_prefix("v1/").unwrap_or(path);
    let base = config.upstream_base_url.trim_end_matches('/');
    let mut url = format!("{base}/{path}");

    let mut params = Vec::new();
    if !query.is_empty() {
        params.push(query.to_string());
    }
    if path.ends_with("chat/completions") {
        if let Some(version) = &config.chat_completions_api_version {
            params.push(format!("api-version={version}"));
        }
    }
    if !params.is_empty() {
        url.push('?');
        url.push_str(&params.join("&"));
    }
    url
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Transport(String),
}

/// Send the request upstream with a single retry on connection-level
/// failure and no wall-clock timeout (streaming bodies may be long-lived).
pub async fn forward(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: ReqwestHeaderMap,
    body: RawBytes,
) -> Result<reqwest::Response, ForwardError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ForwardError::Transport(e.to_string()))?;

    let mut attempts = 0;
    loop {
        attempts += 1;
        let request = client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(body.clone());

        match request.send().await {
            Ok(response) => return Ok(response),
            Err(e) if attempts < 2 && e.is_connect() => {
                warn!(attempt = attempts, error = %e, "upstream connect failed, retrying once");
                continue;
            }
            Err(e) => {
                debug!(error = %e, "upstream request failed after retry budget");
                return Err(ForwardError::Transport(e.to_string()));
            }
        }
    }
}

/// Headers that must never be echoed back verbatim from the upstream
/// response (they describe a transfer framing we've already undone by
/// buffering, or would otherwise conflict with axum's own framing).
pub fn strip_response_framing_headers(headers: &mut HeaderMap) {
    headers.remove("transfer-encoding");
    headers.remove("content-encoding");
}

pub fn reqwest_headers_to_axum(headers: &ReqwestHeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

pub type ResponseBytes = Bytes;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue as AxHeaderValue;

    fn config() -> Config {
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
    fn sensitive_headers_are_never_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", AxHeaderValue::from_static("Bearer sk-abc"));
        headers.insert("x-cashu", AxHeaderValue::from_static("cashuAabc"));
        headers.insert("host", AxHeaderValue::from_static("example.com"));
        headers.insert("content-length", AxHeaderValue::from_static("10"));
        headers.insert("refund-lnurl", AxHeaderValue::from_static("lnurl1"));
        headers.insert("key-expiry-time", AxHeaderValue::from_static("123"));
        headers.insert("content-type", AxHeaderValue::from_static("application/json"));

        let sanitized = sanitize_headers(&headers, &config());
        for forbidden in STRIPPED_HEADERS {
            assert!(!sanitized.contains_key(*forbidden), "{forbidden} leaked upstream");
        }
        assert!(sanitized.contains_key("content-type"));
    }

    #[test]
    fn injects_configured_upstream_key() {
        let mut cfg = config();
        cfg.upstream_api_key = Some("server-key".into());
        let headers = HeaderMap::new();
        let sanitized = sanitize_headers(&headers, &cfg);
        assert_eq!(
            sanitized.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer server-key"
        );
    }

    #[test]
    fn strips_leading_v1_segment() {
        let url = build_upstream_url("v1/chat/completions", "", &config());
        assert_eq!(url, "https://upstream.example/chat/completions");
    }

    #[test]
    fn appends_api_version_for_chat_completions() {
        let mut cfg = config();
        cfg.chat_completions_api_version = Some("2024-01-01".into());
        let url = build_upstream_url("chat/completions", "", &cfg);
        assert_eq!(url, "https://upstream.example/chat/completions?api-version=2024-01-01");
    }

    #[test]
    fn leaves_non_chat_paths_unversioned() {
        let mut cfg = config();
        cfg.chat_completions_api_version = Some("2024-01-01".into());
        let url = build_upstream_url("embeddings", "", &cfg);
        assert_eq!(url, "https://upstream.example/embeddings");
    }
}
