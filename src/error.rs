use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The full error taxonomy of the pricing-and-settlement pipeline.
///
/// Every variant knows its own HTTP status and `error.code`; refunds that
/// accompany an error (Cashu rail) are attached via `with_refund` rather
/// than baked into the enum, since only settlement knows whether a refund
/// was mintable.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("missing api key")]
    MissingApiKey,

    #[error("insufficient balance")]
    InsufficientBalance {
        amount_required_msat: u64,
        model: Option<String>,
        /// Cashu rail gets 413, account rail gets 402.
        cashu_rail: bool,
    },

    #[error("invalid cashu token")]
    InvalidToken,

    #[error("cashu token already spent")]
    AlreadySpent,

    #[error("cashu mint error: {0}")]
    MintError(String),

    #[error("failed to create refund token: {0}")]
    SendTokenFailed(String),

    #[error("invalid request body: {0}")]
    InvalidJson(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("pricing not found for model")]
    PricingNotFound,

    #[error("upstream error: {status}")]
    UpstreamError { status: StatusCode, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::MissingApiKey => StatusCode::UNAUTHORIZED,
            ProxyError::InsufficientBalance { cashu_rail, .. } => {
                if *cashu_rail {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::PAYMENT_REQUIRED
                }
            }
            ProxyError::InvalidToken => StatusCode::BAD_REQUEST,
            ProxyError::AlreadySpent => StatusCode::BAD_REQUEST,
            ProxyError::MintError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::SendTokenFailed(_) => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound(_) => StatusCode::BAD_REQUEST,
            ProxyError::PricingNotFound => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamError { status, .. } => *status,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::MissingApiKey => "missing_api_key",
            ProxyError::InsufficientBalance { .. } => "minimum_balance_required",
            ProxyError::InvalidToken => "invalid_token",
            ProxyError::AlreadySpent => "token_already_spent",
            ProxyError::MintError(_) => "mint_error",
            ProxyError::SendTokenFailed(_) => "send_token_failed",
            ProxyError::InvalidJson(_) => "invalid_json",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::PricingNotFound => "pricing_not_found",
            ProxyError::UpstreamError { .. } => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProxyError::InsufficientBalance { .. } => "Insufficient balance".to_string(),
            ProxyError::UpstreamError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Attach a Cashu refund token to an error response.
    pub fn into_response_with_refund(self, refund_token: Option<String>) -> Response {
        let status = self.status();
        let code = self.code();
        let mut body = json!({
            "error": {
                "message": self.message(),
                "type": "invalid_request_error",
                "code": code,
            }
        });

        if let ProxyError::InsufficientBalance {
            amount_required_msat,
            model,
            ..
        } = &self
        {
            body["reason"] = json!("Insufficient balance");
            body["amount_required_msat"] = json!(amount_required_msat);
            body["model"] = json!(model.clone().unwrap_or_else(|| "unknown".to_string()));
        }

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
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_response_with_refund(None)
    }
}
