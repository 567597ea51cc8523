//! Central error type for the HTTP boundary.
//!
//! Every handler returns `Result<T, AppError>`. `AppError` knows how to
//! render itself as the `{error, requestId}` JSON body the gateway promises
//! callers, with the right status code and (for rate limiting) a
//! `Retry-After` header.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::gate::GateError;
use crate::keystore::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(rename = "requestId")]
    request_id: String,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Gate(e) => e.status(),
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Transport(e) => e.status(),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let status = self.status();

        if !matches!(status, StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE) {
            tracing::error!(request_id = %request_id, err = %format!("{:#}", anyhow::anyhow!(self.to_string())), "internal error");
        }

        let body = Json(ErrorBody {
            error: self.to_string(),
            request_id: request_id.clone(),
        });

        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::HeaderName::from_static(crate::http::REQUEST_ID_HEADER),
            request_id.parse().unwrap(),
        );

        if let AppError::RateLimited { retry_after_secs } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                retry_after_secs.to_string().parse().unwrap(),
            );
        }

        response
    }
}
