//! Domain-specific error types following panic-free policy.

use crate::DeviceId;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Device is not attached
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    /// A required field was empty
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    /// Stream URL could not be built for a device
    #[error("Invalid stream URL for {device_id}: {reason}")]
    InvalidStreamUrl { device_id: DeviceId, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
