//! Session registry using Actor pattern.
//!
//! The registry is the central state manager for attached devices. It owns
//! every device session, relays credential updates to them, records the
//! peer info found by discovery and drives the worker supervisor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ API / host / poll│────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   start/stop          │   HostEvent
//!         │   (mpsc channel)      ▼                       ▼
//!         ▼                 SupervisorHandle         host event sink
//!    attach/detach,
//!    credentials, events
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use crowdpulse_core::CredentialStore;
use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, RegistrySettings, MAX_DEVICES};
pub use commands::{HostEvent, RegistryCommand, RegistryError};
pub use handle::RegistryHandle;

use crate::reader::{MetadataSender, TransportFactory};
use crate::supervisor::SupervisorHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels and the shared credential store
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Returns a RegistryHandle for client use
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use crowdpulsed::reader::{metadata_channel, RtspTransportFactory};
/// use crowdpulsed::registry::{spawn_registry, RegistrySettings};
/// use crowdpulsed::supervisor::{spawn_supervisor, SupervisorConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let supervisor = spawn_supervisor(SupervisorConfig {
///         program: "python3".into(),
///         module: "flaskr".into(),
///         restart_delay: std::time::Duration::from_secs(1),
///         stop_timeout: std::time::Duration::from_secs(30),
///         forward_output: false,
///     });
///     let (metadata_tx, _metadata_rx) = metadata_channel();
///     let settings = RegistrySettings {
///         work_dir: "/tmp/flask_app".into(),
///         web_app_port: 5000,
///         control_api_port: 41000,
///         auto_restart: true,
///     };
///     let handle = spawn_registry(settings, supervisor, Arc::new(RtspTransportFactory), metadata_tx);
///
///     let devices = handle.list_devices().await;
/// }
/// ```
pub fn spawn_registry(
    settings: RegistrySettings,
    supervisor: SupervisorHandle,
    transports: Arc<dyn TransportFactory>,
    metadata_tx: MetadataSender,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let credentials = CredentialStore::new();

    let actor = RegistryActor::new(
        cmd_rx,
        event_tx.clone(),
        credentials.clone(),
        settings,
        supervisor,
        transports,
        metadata_tx,
    );
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx, credentials)
}
