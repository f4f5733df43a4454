//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to host events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use crowdpulse_core::{
    AnalyticsEvent, CredentialStore, Credentials, DeviceId, DiagnosticEvent, PeerInfo,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

use super::commands::{HostEvent, RegistryCommand, RegistryError};
use crate::session::SessionView;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
///
/// # Usage
///
/// ```ignore
/// let handle = registry_handle.clone();
///
/// handle.attach(DeviceId::new("cam1"), url).await?;
/// handle.media_started(DeviceId::new("cam1")).await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Hand the event to the host
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<HostEvent>,

    /// Shared credentials, readable without a round-trip
    credentials: CredentialStore,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<HostEvent>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            sender,
            event_sender,
            credentials,
        }
    }

    /// Sends a command built around a fresh oneshot and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Attach a device session.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn attach(&self, device_id: DeviceId, stream_url: Url) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Attach {
            device_id,
            stream_url,
            respond_to,
        })
        .await?
    }

    /// Attach a device with a stream URL built from the peer port.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::InvalidStreamUrl` if the id yields no valid URL
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn attach_derived(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::AttachDerived {
            device_id,
            respond_to,
        })
        .await?
    }

    /// Detach a device session. Returns `false` if it was not attached.
    pub async fn detach(&self, device_id: DeviceId) -> Result<bool, RegistryError> {
        self.request(|respond_to| RegistryCommand::Detach {
            device_id,
            respond_to,
        })
        .await
    }

    /// Report the device's first frame; starts its reader once credentials exist.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DeviceNotFound` if the device isn't attached
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn media_started(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::MediaStarted {
            device_id,
            respond_to,
        })
        .await?
    }

    /// Replace the shared credentials.
    ///
    /// Returns whether they changed. Sessions are notified only on change.
    pub async fn update_credentials(&self, credentials: Credentials) -> Result<bool, RegistryError> {
        self.request(|respond_to| RegistryCommand::UpdateCredentials {
            credentials,
            respond_to,
        })
        .await
    }

    /// Forward an analytics event for an attached device.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DeviceNotFound` if the device isn't attached
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn push_analytics_event(
        &self,
        device_id: DeviceId,
        event: AnalyticsEvent,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::PushAnalyticsEvent {
            device_id,
            event,
            respond_to,
        })
        .await?
    }

    /// Forward a plugin-level diagnostic.
    pub async fn push_diagnostic_event(&self, event: DiagnosticEvent) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::PushDiagnosticEvent { event, respond_to })
            .await
    }

    /// Snapshot of attached device ids, in no particular order.
    pub async fn list_devices(&self) -> Result<Vec<DeviceId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::ListDevices { respond_to })
            .await
    }

    /// Snapshot of one session.
    pub async fn get_session(&self, device_id: DeviceId) -> Result<Option<SessionView>, RegistryError> {
        self.request(|respond_to| RegistryCommand::GetSession {
            device_id,
            respond_to,
        })
        .await
    }

    /// Record discovered peer info and launch the worker.
    pub async fn peer_info_discovered(&self, info: PeerInfo) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::PeerInfoDiscovered { info, respond_to })
            .await
    }

    /// Peer info recorded so far.
    pub async fn peer_info(&self) -> Result<Option<PeerInfo>, RegistryError> {
        self.request(|respond_to| RegistryCommand::GetPeerInfo { respond_to })
            .await
    }

    /// Stop the worker; it stays down until restarted.
    pub async fn stop_worker(&self) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::StopWorker { respond_to })
            .await?
    }

    /// Restart the worker.
    pub async fn restart_worker(&self) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::RestartWorker { respond_to })
            .await?
    }

    /// Stop every reader and the worker, then end the actor.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Shutdown { respond_to })
            .await
    }

    /// Current credentials.
    pub fn credentials(&self) -> Credentials {
        self.credentials.get()
    }

    /// Subscribe to host events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.event_sender.subscribe()
    }

    /// Returns true if the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
