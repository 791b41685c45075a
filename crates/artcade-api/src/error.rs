use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use artcade_types::api::ErrorResponse;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("Malformed SIWE message: {0}")]
    InvalidMessage(String),

    #[error("Invalid nonce")]
    InvalidNonce,

    #[error("Nonce expired, please try again")]
    NonceExpired,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid OTP")]
    OtpInvalid,

    #[error("OTP expired, please try again")]
    OtpExpired,

    #[error("CSRF Failed: {0}")]
    CsrfFailed(&'static str),

    #[error("Authentication credentials were not provided or are invalid")]
    Unauthenticated,

    #[error("Maximum amount of tokens allowed per user exceeded")]
    TokenLimitExceeded,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code sent alongside the human `detail`.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::InvalidMessage(_) => "invalid_message",
            AuthError::InvalidNonce => "invalid_nonce",
            AuthError::NonceExpired => "nonce_expired",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::OtpInvalid => "otp_invalid",
            AuthError::OtpExpired => "otp_expired",
            AuthError::CsrfFailed(_) => "csrf_failed",
            AuthError::Unauthenticated => "not_authenticated",
            AuthError::TokenLimitExceeded => "token_limit_exceeded",
            AuthError::Infrastructure(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidRequest(_)
            | AuthError::InvalidMessage(_)
            | AuthError::InvalidNonce
            | AuthError::NonceExpired
            | AuthError::InvalidSignature
            | AuthError::OtpInvalid
            | AuthError::OtpExpired => StatusCode::BAD_REQUEST,
            AuthError::CsrfFailed(_) | AuthError::TokenLimitExceeded => StatusCode::FORBIDDEN,
            AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AuthError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        AuthError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let detail = match &self {
            AuthError::Infrastructure(e) => {
                error!("Auth infrastructure error: {:#}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            detail,
            code: self.code().to_string(),
        };
        let mut res = (self.status(), Json(body)).into_response();

        if matches!(self, AuthError::Unauthenticated) {
            res.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Token"));
        }
        res
    }
}
