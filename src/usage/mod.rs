//! Usage Extractor: sniffs a response body as JSON or SSE and surfaces
//! `{model, prompt_tokens, completion_tokens}`.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A tagged-variant decision on response shape, constructed by sniffing
/// the first non-whitespace bytes / `data:` markers rather than a subtype
/// hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    Json(Bytes),
    Sse(Bytes),
}

pub fn sniff(body: &Bytes) -> ResponseShape {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start();
    if trimmed.starts_with("data:") || trimmed.contains("\ndata:") {
        ResponseShape::Sse(body.clone())
    } else {
        ResponseShape::Json(body.clone())
    }
}

/// Extract usage from either shape. Returns `None` ("base-only") if no
/// usage field is found anywhere in the body.
pub fn extract_usage(shape: &ResponseShape) -> Option<Usage> {
    match shape {
        ResponseShape::Json(bytes) => extract_from_json(bytes),
        ResponseShape::Sse(bytes) => extract_from_sse(bytes),
    }
}

fn extract_from_json(bytes: &Bytes) -> Option<Usage> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    usage_from_value(&value)
}

/// Parse line-by-line, decoding each `data: {...}` payload as JSON.
/// Retains the *last* payload that carries a `usage` field, plus the
/// first `model` seen. Lines that fail to decode are skipped, never
/// aborting the whole parse.
fn extract_from_sse(bytes: &Bytes) -> Option<Usage> {
    let text = String::from_utf8_lossy(bytes);
    let mut usage: Option<(u64, u64)> = None;
    let mut model: Option<String> = None;

    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };

        if let Some(u) = value.get("usage").and_then(parse_usage_fields) {
            usage = Some(u);
            if let Some(m) = value.get("model").and_then(|v| v.as_str()) {
                model = Some(m.to_string());
            }
        } else if model.is_none() {
            if let Some(m) = value.get("model").and_then(|v| v.as_str()) {
                model = Some(m.to_string());
            }
        }
    }

    let (prompt_tokens, completion_tokens) = usage?;
    Some(Usage {
        model: model.unwrap_or_default(),
        prompt_tokens,
        completion_tokens,
    })
}

fn usage_from_value(value: &serde_json::Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let (prompt_tokens, completion_tokens) = parse_usage_fields(usage)?;
    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(Usage {
        model,
        prompt_tokens,
        completion_tokens,
    })
}

fn parse_usage_fields(usage: &serde_json::Value) -> Option<(u64, u64)> {
    if usage.is_null() {
        return None;
    }
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let completion = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    Some((prompt, completion))
}
