//! Route handlers.
//!
//! Bodies are taken as raw bytes and decoded leniently so a missing or
//! odd `Content-Type` from the worker never changes the outcome. Nothing
//! reaches the registry until the body has validated.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use crowdpulse_core::DeviceId;
use crowdpulse_protocol::{parse_analytics_event, parse_credentials, parse_diagnostic_event};
use tracing::debug;

use super::error::ApiError;
use crate::registry::RegistryHandle;

/// `POST /plugin/sendDiagEvent`
pub async fn send_diag_event(
    State(registry): State<RegistryHandle>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event = parse_diagnostic_event(&body);
    if !event.is_valid() {
        return Err(ApiError::BadRequest(
            "caption and description are required".to_string(),
        ));
    }

    registry.push_diagnostic_event(event).await?;
    Ok(StatusCode::OK)
}

/// `POST /plugin/token`
pub async fn update_token(
    State(registry): State<RegistryHandle>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let credentials = parse_credentials(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if !credentials.is_valid() {
        return Err(ApiError::Unprocessable(
            "user and token must be non-empty".to_string(),
        ));
    }

    let changed = registry.update_credentials(credentials).await?;
    debug!(changed, "Token update received");
    Ok(StatusCode::OK)
}

/// `POST /device/{device_id}/sendEvent`
pub async fn send_device_event(
    State(registry): State<RegistryHandle>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let device_id = DeviceId::new(device_id);
    if registry.get_session(device_id.clone()).await?.is_none() {
        return Err(ApiError::DeviceNotFound(device_id));
    }

    let event = parse_analytics_event(&body);
    if !event.is_valid() {
        return Err(ApiError::BadRequest("type is required".to_string()));
    }

    registry.push_analytics_event(device_id, event).await?;
    Ok(StatusCode::OK)
}

/// `GET /device/listActive`
pub async fn list_active(
    State(registry): State<RegistryHandle>,
) -> Result<Json<Vec<DeviceId>>, ApiError> {
    Ok(Json(registry.list_devices().await?))
}
