//! Credential Classifier: parses authorization material and routes
//! the request to exactly one of {Cashu, Account, Unauthorized}.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub enum Credential {
    Account { hashed_key: String },
    Cashu { token: String },
}

/// Hash an `sk-`-prefixed API key into its opaque `hashed_key` form.
/// One-way so the raw key is never persisted.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Total classification per the resolution order:
/// 1. `X-Cashu` header present and non-empty → Cashu rail.
/// 2. `Authorization: Bearer <v>` with `sk-` prefix → Account rail.
/// 3. `Authorization: Bearer <v>` without `sk-` prefix → Cashu rail.
/// 4. Otherwise → `Unauthorized`.
pub fn classify(headers: &HeaderMap) -> Result<Credential, ProxyError> {
    if let Some(x_cashu) = header_str(headers, "x-cashu") {
        let token = x_cashu.trim();
        if !token.is_empty() {
            return Ok(Credential::Cashu {
                token: token.to_string(),
            });
        }
    }

    let Some(auth) = header_str(headers, "authorization") else {
        return Err(ProxyError::Unauthorized);
    };

    // Only an `Authorization: Bearer <v>` shape is classifiable per §4.E;
    // any other scheme (Basic, Digest, ...) falls through to Unauthorized
    // rather than being treated as an empty bearer value.
    let Some(rest) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) else {
        return Err(ProxyError::Unauthorized);
    };
    let value = rest.trim();

    if value.is_empty() {
        return Err(ProxyError::MissingApiKey);
    }

    if let Some(key) = value.strip_prefix("sk-") {
        Ok(Credential::Account {
            hashed_key: hash_api_key(key),
        })
    } else {
        Ok(Credential::Cashu {
            token: value.to_string(),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
