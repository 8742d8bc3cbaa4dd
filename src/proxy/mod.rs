//! The pricing-and-settlement pipeline's HTTP entry point: wires
//! Credential Classifier → Pre-charge Admission → Upstream Forwarder →
//! Usage Extractor → Cost Calculator → Settlement into one request flow.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use crate::admission;
use crate::cost::{self, CostOutcome};
use crate::credential;
use crate::error::ProxyError;
use crate::forwarder;
use crate::settlement;
use crate::state::AppState;
use crate::usage::{self, ResponseShape};

pub async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match run_pipeline(&state, method, &path, &headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run_pipeline(
    state: &AppState,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let credential = credential::classify(headers)?;
    let requested_model = peek_model(&body);

    let max_cost_msat = admission::max_cost_for_model(
        requested_model.as_deref(),
        &state.config,
        &state.catalogue,
    );

    let rail = rail_name(&credential);
    counter!("proxy_requests_total", "rail" => rail).increment(1);

    info!(
        rail,
        model = requested_model.as_deref().unwrap_or("unknown"),
        max_cost_msat,
        "request classified and pre-charge computed"
    );

    let admission = admission::admit(
        credential,
        requested_model.as_deref(),
        max_cost_msat,
        state.ledger.as_ref(),
        state.wallet.as_ref(),
    )
    .await
    .map_err(|err| {
        counter!("proxy_admission_rejected_total", "rail" => rail).increment(1);
        err
    })?;

    let upstream_headers = forwarder::sanitize_headers(headers, &state.config);
    let url = forwarder::build_upstream_url(path, "", &state.config);

    let upstream_response = match forwarder::forward(
        &state.http_client,
        method,
        &url,
        upstream_headers,
        body,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, url, "upstream forwarding failed");
            counter!("proxy_upstream_errors_total", "kind" => "transport").increment(1);
            let outcome = settlement::settle_emergency(
                &admission,
                state.ledger.as_ref(),
                state.wallet.as_ref(),
            )
            .await?;
            return Ok(ProxyError::UpstreamError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "An unexpected server error occurred".to_string(),
            }
            .into_response_with_refund(outcome.refund_token));
        }
    };

    let status = upstream_response.status();
    let mut response_headers = forwarder::reqwest_headers_to_axum(upstream_response.headers());
    forwarder::strip_response_framing_headers(&mut response_headers);

    let response_bytes = upstream_response
        .bytes()
        .await
        .map_err(|e| ProxyError::Internal(anyhow::anyhow!("failed to read upstream body: {e}")))?;

    if !status.is_success() {
        warn!(%status, "upstream returned non-2xx, issuing processing-fee refund");
        counter!("proxy_upstream_errors_total", "kind" => "http_status").increment(1);
        let outcome =
            settlement::settle_upstream_error(&admission, state.ledger.as_ref(), state.wallet.as_ref())
                .await?;
        return Ok(upstream_error_response(status, outcome.refund_token));
    }

    let shape = usage::sniff(&response_bytes);
    let (usage_value, parse_failed) = match &shape {
        ResponseShape::Json(bytes) => match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(_) => (usage::extract_usage(&shape), false),
            Err(_) => (None, true),
        },
        ResponseShape::Sse(_) => (usage::extract_usage(&shape), false),
    };

    if parse_failed {
        warn!("upstream body failed JSON/SSE parse, issuing emergency refund");
        counter!("proxy_emergency_refunds_total", "reason" => "unparseable_body").increment(1);
        let outcome = settlement::settle_emergency(
            &admission,
            state.ledger.as_ref(),
            state.wallet.as_ref(),
        )
        .await?;
        return Ok(pass_through_response(
            status,
            response_headers,
            response_bytes,
            outcome.refund_token,
        ));
    }

    let effective_max_cost = match &usage_value {
        Some(u) => admission::max_cost_for_model(Some(&u.model), &state.config, &state.catalogue),
        None => max_cost_msat,
    };

    let cost_outcome = cost::calculate_cost(
        usage_value.as_ref(),
        effective_max_cost,
        &state.config,
        &state.catalogue,
    );

    if let CostOutcome::Error { message, code } = &cost_outcome {
        warn!(code, message, "cost calculation failed, refunding pre-auth in full");
        counter!("proxy_cost_errors_total", "code" => *code).increment(1);
        let outcome = settlement::settle_emergency(
            &admission,
            state.ledger.as_ref(),
            state.wallet.as_ref(),
        )
        .await?;
        let body = json!({
            "error": {
                "message": message,
                "type": "invalid_request_error",
                "code": code,
            }
        });
        let mut resp = (StatusCode::BAD_REQUEST, Json(body)).into_response();
        if let Some(token) = outcome.refund_token {
            if let Ok(value) = token.parse() {
                resp.headers_mut().insert("X-Cashu", value);
            }
        }
        return Ok(resp);
    }

    let settlement_outcome = settlement::settle(
        &admission,
        &cost_outcome,
        state.ledger.as_ref(),
        state.wallet.as_ref(),
    )
    .await?;

    info!(
        final_msat = settlement_outcome.final_msat,
        refunded = settlement_outcome.refund_token.is_some(),
        "request settled"
    );

    counter!("proxy_requests_settled_total", "rail" => rail).increment(1);
    histogram!("proxy_final_cost_msat").record(settlement_outcome.final_msat as f64);
    if settlement_outcome.refund_token.is_some() {
        counter!("proxy_refunds_minted_total").increment(1);
    }

    Ok(pass_through_response(
        status,
        response_headers,
        response_bytes,
        settlement_outcome.refund_token,
    ))
}

/// Best-effort extraction of the `model` field from the inbound JSON body.
/// Any failure to parse is not an error here — admission simply falls back
/// to the flat tariff.
fn peek_model(body: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

fn rail_name(credential: &credential::Credential) -> &'static str {
    match credential {
        credential::Credential::Account { .. } => "account",
        credential::Credential::Cashu { .. } => "cashu",
    }
}

fn upstream_error_response(status: StatusCode, refund_token: Option<String>) -> Response {
    let mut body = json!({
        "error": {
            "message": "Error forwarding request to upstream",
            "type": "upstream_error",
            "code": status.as_u16(),
        }
    });
    if let Some(token) = &refund_token {
        body["error"]["refund_token"] = json!(token);
    }
    let mut response = (status, Json(body)).into_response();
    if let Some(token) = refund_token {
        if let Ok(value) = token.parse() {
            response.headers_mut().insert("X-Cashu", value);
        }
    }
    response
}

fn pass_through_response(
    status: StatusCode,
    mut headers: HeaderMap,
    body: Bytes,
    refund_token: Option<String>,
) -> Response {
    if let Some(token) = &refund_token {
        if let Ok(value) = token.parse() {
            headers.insert("X-Cashu", value);
        }
    }
    let mut response = (status, body).into_response();
    *response.headers_mut() = headers;
    response
}
