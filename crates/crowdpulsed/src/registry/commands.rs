//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `HostEvent`: Events the registry hands to the host
//!
//! All types are designed for async message passing and follow the panic-free policy.

use chrono::{DateTime, Utc};
use crowdpulse_core::{AnalyticsEvent, Credentials, DeviceId, DiagnosticEvent, PeerInfo};
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

use crate::session::SessionView;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Attach a device session.
    ///
    /// Re-attaching an id replaces the previous session.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    Attach {
        device_id: DeviceId,
        stream_url: Url,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Attach a device whose stream URL is built from the peer port.
    ///
    /// Uses the discovered port once known, the default port before that.
    /// The URL follows the port when discovery later reports it.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::InvalidStreamUrl` if no URL can be built for the id
    AttachDerived {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Detach a device session. Responds `false` if it was not attached.
    Detach {
        device_id: DeviceId,
        respond_to: oneshot::Sender<bool>,
    },

    /// The host saw the device's first frame.
    ///
    /// # Errors
    /// - `RegistryError::DeviceNotFound` if the device isn't attached
    MediaStarted {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Replace the shared credentials and notify every session.
    ///
    /// Responds whether the credentials changed.
    UpdateCredentials {
        credentials: Credentials,
        respond_to: oneshot::Sender<bool>,
    },

    /// Forward an analytics event for an attached device to the host.
    ///
    /// # Errors
    /// - `RegistryError::DeviceNotFound` if the device isn't attached
    PushAnalyticsEvent {
        device_id: DeviceId,
        event: AnalyticsEvent,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Forward a plugin-level diagnostic to the host.
    PushDiagnosticEvent {
        event: DiagnosticEvent,
        respond_to: oneshot::Sender<()>,
    },

    /// Ids of all attached devices.
    ListDevices {
        respond_to: oneshot::Sender<Vec<DeviceId>>,
    },

    /// Snapshot of one session.
    GetSession {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Option<SessionView>>,
    },

    /// Peer capabilities were discovered; launches the worker.
    PeerInfoDiscovered {
        info: PeerInfo,
        respond_to: oneshot::Sender<()>,
    },

    /// Capabilities recorded so far.
    GetPeerInfo {
        respond_to: oneshot::Sender<Option<PeerInfo>>,
    },

    /// Stop the worker without auto-restart.
    StopWorker {
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Restart the worker.
    RestartWorker {
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Stop every reader and the worker, then end the actor.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum device capacity.
    #[error("registry is full (max: {max} devices)")]
    RegistryFull { max: usize },

    /// The device is not attached.
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// No stream URL can be built for the device id.
    #[error("invalid stream url: {0}")]
    InvalidStreamUrl(String),

    /// The worker has not been launched yet.
    #[error("worker not started")]
    WorkerNotStarted,

    /// The supervisor task is gone.
    #[error("supervisor unavailable")]
    SupervisorUnavailable,

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Host Events
// ============================================================================

/// Events published by the registry for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A per-device analytics event, stamped when it was received.
    Analytics {
        device_id: DeviceId,
        event: AnalyticsEvent,
        timestamp: DateTime<Utc>,
    },

    /// A plugin-level diagnostic.
    Diagnostic(DiagnosticEvent),

    /// A device session was attached.
    DeviceAttached { device_id: DeviceId },

    /// A device session was detached.
    DeviceDetached { device_id: DeviceId },
}

impl HostEvent {
    pub fn analytics(device_id: DeviceId, event: AnalyticsEvent) -> Self {
        Self::Analytics {
            device_id,
            event,
            timestamp: Utc::now(),
        }
    }
}
