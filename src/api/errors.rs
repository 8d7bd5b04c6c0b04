use crate::broker::BrokerError;
use crate::errors::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub code: u16,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiError({}, {})", self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::Json(self);
        (status, body).into_response()
    }
}

/// Helper function to create API errors
pub fn api_error(status: StatusCode, message: &str) -> ApiError {
    ApiError {
        message: message.to_string(),
        code: status.as_u16(),
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::DuplicateTask { .. } | Error::StepOutOfOrder { .. } => StatusCode::CONFLICT,
            Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::PoolError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                error!("Store error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, &e.to_string())
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::NoCapableAgent(_) => {
                api_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
            }
        }
    }
}
