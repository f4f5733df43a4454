//! Status outcomes of control API handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crowdpulse_core::DeviceId;
use thiserror::Error;
use tracing::debug;

use crate::registry::RegistryError;

/// A rejected control API request.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Body is not a JSON object or fails validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The device in the path is not attached.
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Well-formed but semantically unusable body.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// The registry is shutting down.
    #[error("service unavailable")]
    Unavailable,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            _ => Self::Unavailable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(error = %self, "Control API request rejected");
        self.status().into_response()
    }
}
