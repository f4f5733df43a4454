//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of device sessions, the recorded
//! peer info and the worker lifecycle. It receives commands via an mpsc
//! channel and publishes host events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crowdpulse_core::{
    stream_url_for, AnalyticsEvent, CredentialStore, Credentials, DeviceId, DiagnosticEvent,
    PeerInfo, DEFAULT_PEER_PORT,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::commands::{HostEvent, RegistryCommand, RegistryError};
use crate::reader::{MetadataSender, TransportFactory};
use crate::session::{ReaderContext, Session, SessionView};
use crate::supervisor::{OnStarted, SupervisorHandle, WorkerParameters};

// ============================================================================
// Resource Limits
// ============================================================================

/// Maximum number of devices the registry can hold.
pub const MAX_DEVICES: usize = 256;

// ============================================================================
// Settings
// ============================================================================

/// Worker launch settings known before peer discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Directory the worker is launched in.
    pub work_dir: PathBuf,
    /// Port of the worker's web application.
    pub web_app_port: u16,
    /// Port the local control API is bound to.
    pub control_api_port: u16,
    /// Whether the worker is restarted after unexpected exits.
    pub auto_restart: bool,
}

impl RegistrySettings {
    fn worker_parameters(&self, peer: &PeerInfo) -> WorkerParameters {
        WorkerParameters {
            work_dir: self.work_dir.clone(),
            web_app_port: self.web_app_port,
            control_api_port: self.control_api_port,
            peer_port: peer.port,
            auto_restart: self.auto_restart,
        }
    }
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all session state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
///
/// # Ownership
///
/// The actor owns:
/// - `sessions`: device sessions keyed by device id
/// - `peer_info`: capabilities from the first successful discovery
/// - `worker_started`: whether the supervisor was asked to launch
///
/// The credential store is shared with the handle so the poller can read
/// the token without a round-trip; it is only written from here.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    sessions: HashMap<DeviceId, Session>,

    credentials: CredentialStore,

    peer_info: Option<PeerInfo>,

    worker_started: bool,

    settings: RegistrySettings,

    supervisor: SupervisorHandle,

    transports: Arc<dyn TransportFactory>,

    metadata_tx: MetadataSender,

    /// Event publisher for the host
    event_publisher: broadcast::Sender<HostEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<HostEvent>,
        credentials: CredentialStore,
        settings: RegistrySettings,
        supervisor: SupervisorHandle,
        transports: Arc<dyn TransportFactory>,
        metadata_tx: MetadataSender,
    ) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            credentials,
            peer_info: None,
            worker_started: false,
            settings,
            supervisor,
            transports,
            metadata_tx,
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until a shutdown command arrives or the channel
    /// closes (all senders dropped).
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if let RegistryCommand::Shutdown { respond_to } = cmd {
                self.shutdown().await;
                let _ = respond_to.send(());
                return;
            }
            self.handle_command(cmd).await;
        }

        self.shutdown().await;
    }

    /// Dispatches a command to the appropriate handler.
    async fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Attach {
                device_id,
                stream_url,
                respond_to,
            } => {
                let session = Session::new(device_id, stream_url);
                let result = self.handle_attach(session).await;
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::AttachDerived {
                device_id,
                respond_to,
            } => {
                let result = self.handle_attach_derived(device_id).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::Detach {
                device_id,
                respond_to,
            } => {
                let removed = self.handle_detach(&device_id).await;
                let _ = respond_to.send(removed);
            }
            RegistryCommand::MediaStarted {
                device_id,
                respond_to,
            } => {
                let result = self.handle_media_started(&device_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::UpdateCredentials {
                credentials,
                respond_to,
            } => {
                let changed = self.handle_update_credentials(credentials);
                let _ = respond_to.send(changed);
            }
            RegistryCommand::PushAnalyticsEvent {
                device_id,
                event,
                respond_to,
            } => {
                let result = self.handle_push_analytics(device_id, event);
                let _ = respond_to.send(result);
            }
            RegistryCommand::PushDiagnosticEvent { event, respond_to } => {
                self.publish_diagnostic(event);
                let _ = respond_to.send(());
            }
            RegistryCommand::ListDevices { respond_to } => {
                let _ = respond_to.send(self.sessions.keys().cloned().collect());
            }
            RegistryCommand::GetSession {
                device_id,
                respond_to,
            } => {
                let view = self.sessions.get(&device_id).map(Session::view);
                let _ = respond_to.send(view);
            }
            RegistryCommand::PeerInfoDiscovered { info, respond_to } => {
                self.handle_peer_info(info).await;
                let _ = respond_to.send(());
            }
            RegistryCommand::GetPeerInfo { respond_to } => {
                let _ = respond_to.send(self.peer_info);
            }
            RegistryCommand::StopWorker { respond_to } => {
                let result = self.handle_stop_worker().await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::RestartWorker { respond_to } => {
                let result = self.handle_restart_worker().await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::Shutdown { respond_to } => {
                // Handled in `run`; answer anyway so callers never hang.
                let _ = respond_to.send(());
            }
        }
    }

    // ========================================================================
    // Session Handlers
    // ========================================================================

    async fn handle_attach(&mut self, session: Session) -> Result<(), RegistryError> {
        let device_id = session.id().clone();
        if let Some(mut previous) = self.sessions.remove(&device_id) {
            debug!(device_id = %device_id, "Replacing existing session");
            previous.stop_reader().await;
        } else if self.sessions.len() >= MAX_DEVICES {
            warn!(
                device_id = %device_id,
                max = MAX_DEVICES,
                "Registry is full, rejecting attach"
            );
            return Err(RegistryError::RegistryFull { max: MAX_DEVICES });
        }

        info!(
            device_id = %device_id,
            url = %session.stream_url(),
            derived = session.has_derived_url(),
            total_devices = self.sessions.len() + 1,
            "Device attached"
        );
        self.sessions.insert(device_id.clone(), session);
        let _ = self
            .event_publisher
            .send(HostEvent::DeviceAttached { device_id });
        Ok(())
    }

    async fn handle_attach_derived(&mut self, device_id: DeviceId) -> Result<(), RegistryError> {
        let url = stream_url_for(&device_id, self.peer_port())
            .map_err(|e| RegistryError::InvalidStreamUrl(e.to_string()))?;
        self.handle_attach(Session::derived(device_id, url)).await
    }

    /// Port derived stream URLs point at.
    fn peer_port(&self) -> u16 {
        self.peer_info.map_or(DEFAULT_PEER_PORT, |p| p.port)
    }

    async fn handle_detach(&mut self, device_id: &DeviceId) -> bool {
        let Some(mut session) = self.sessions.remove(device_id) else {
            debug!(device_id = %device_id, "Detach of unknown device ignored");
            return false;
        };

        session.stop_reader().await;
        info!(
            device_id = %device_id,
            total_devices = self.sessions.len(),
            "Device detached"
        );
        let _ = self.event_publisher.send(HostEvent::DeviceDetached {
            device_id: device_id.clone(),
        });
        true
    }

    fn handle_media_started(&mut self, device_id: &DeviceId) -> Result<(), RegistryError> {
        let ctx = ReaderContext {
            credentials: &self.credentials,
            transports: self.transports.as_ref(),
            metadata_tx: &self.metadata_tx,
        };
        let session = self
            .sessions
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.clone()))?;

        session.media_started(&ctx);
        Ok(())
    }

    /// Stores the credentials and restarts started readers. Restarts run
    /// on the readers' own tasks, so this never waits on a peer.
    fn handle_update_credentials(&mut self, credentials: Credentials) -> bool {
        if !self.credentials.update(credentials) {
            debug!("Credentials unchanged, nothing to propagate");
            return false;
        }

        info!(sessions = self.sessions.len(), "Credentials updated, notifying sessions");
        let ctx = ReaderContext {
            credentials: &self.credentials,
            transports: self.transports.as_ref(),
            metadata_tx: &self.metadata_tx,
        };
        for session in self.sessions.values_mut() {
            session.credentials_changed(&ctx);
        }
        true
    }

    fn handle_push_analytics(&self, device_id: DeviceId, event: AnalyticsEvent) -> Result<(), RegistryError> {
        if !self.sessions.contains_key(&device_id) {
            return Err(RegistryError::DeviceNotFound(device_id));
        }

        debug!(device_id = %device_id, event_type = %event.event_type, "Analytics event");
        let _ = self
            .event_publisher
            .send(HostEvent::analytics(device_id, event));
        Ok(())
    }

    fn publish_diagnostic(&self, event: DiagnosticEvent) {
        info!(
            level = %event.level,
            caption = %event.caption,
            "Diagnostic event"
        );
        let _ = self.event_publisher.send(HostEvent::Diagnostic(event));
    }

    // ========================================================================
    // Worker Handlers
    // ========================================================================

    async fn handle_peer_info(&mut self, info: PeerInfo) {
        if self.peer_info.is_some() {
            debug!(?info, "Peer info already known, ignoring");
            return;
        }

        info!(port = info.port, capability = info.capability_present, "Peer info discovered");
        self.peer_info = Some(info);
        self.retarget_derived_sessions();

        if !info.capability_present {
            self.publish_diagnostic(DiagnosticEvent::warning(
                "Nx AI Manager not found",
                "Analytics capability is missing on the server; results may be incomplete.",
            ));
        }

        self.ensure_worker_started().await;
    }

    /// Moves derived stream URLs onto the discovered port.
    fn retarget_derived_sessions(&mut self) {
        let port = self.peer_port();
        let ctx = ReaderContext {
            credentials: &self.credentials,
            transports: self.transports.as_ref(),
            metadata_tx: &self.metadata_tx,
        };
        for session in self.sessions.values_mut().filter(|s| s.has_derived_url()) {
            match stream_url_for(session.id(), port) {
                Ok(url) => {
                    session.retarget(url, &ctx);
                }
                Err(e) => warn!(device_id = %session.id(), error = %e, "Cannot rebuild stream url"),
            }
        }
    }

    /// Launches the worker once; later calls only refresh its parameters.
    async fn ensure_worker_started(&mut self) {
        let Some(peer) = self.peer_info else {
            return;
        };
        let params = self.settings.worker_parameters(&peer);

        let result = if self.worker_started {
            self.supervisor.update_parameters(params).await
        } else {
            let events = self.event_publisher.clone();
            let on_started: OnStarted = Arc::new(move |ok| {
                if !ok {
                    error!("Web Application failed to start");
                    let _ = events.send(HostEvent::Diagnostic(DiagnosticEvent::error(
                        "Web Application failed to start",
                        "The analytics worker process could not be launched.",
                    )));
                }
            });
            self.supervisor.start(params, on_started).await
        };

        match result {
            Ok(()) => self.worker_started = true,
            Err(e) => warn!(error = %e, "Supervisor unavailable"),
        }
    }

    async fn handle_stop_worker(&mut self) -> Result<(), RegistryError> {
        if !self.worker_started {
            return Err(RegistryError::WorkerNotStarted);
        }
        self.supervisor
            .stop()
            .await
            .map_err(|_| RegistryError::SupervisorUnavailable)
    }

    async fn handle_restart_worker(&mut self) -> Result<(), RegistryError> {
        if !self.worker_started {
            return Err(RegistryError::WorkerNotStarted);
        }
        self.supervisor
            .restart()
            .await
            .map_err(|_| RegistryError::SupervisorUnavailable)
    }

    async fn shutdown(&mut self) {
        for session in self.sessions.values_mut() {
            session.stop_reader().await;
        }
        if let Err(e) = self.supervisor.shutdown().await {
            debug!(error = %e, "Supervisor already gone");
        }
        info!(devices = self.sessions.len(), "Registry actor stopped");
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    /// Returns the number of attached devices.
    pub fn device_count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns a snapshot of a session.
    pub fn session_view(&self, device_id: &DeviceId) -> Option<SessionView> {
        self.sessions.get(device_id).map(Session::view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{metadata_channel, MediaTransport, TrackInfo, TransportError};
    use crate::supervisor::{spawn_supervisor, SupervisorConfig};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use url::Url;

    struct IdleTransport;

    #[async_trait]
    impl MediaTransport for IdleTransport {
        async fn open(
            &mut self,
            _url: &Url,
            _credentials: &Credentials,
        ) -> Result<Vec<TrackInfo>, TransportError> {
            Ok(vec![TrackInfo::new(103, "t140", 0)])
        }
        async fn play(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn read_frame(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            std::future::pending().await
        }
        async fn close(&mut self) {}
    }

    fn settings() -> RegistrySettings {
        RegistrySettings {
            work_dir: std::env::temp_dir(),
            web_app_port: 5000,
            control_api_port: 41000,
            auto_restart: false,
        }
    }

    fn create_actor(program: &str) -> (RegistryActor, broadcast::Receiver<HostEvent>) {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let (metadata_tx, _metadata_rx) = metadata_channel();
        let supervisor = spawn_supervisor(SupervisorConfig {
            program: program.to_string(),
            module: "flaskr".to_string(),
            restart_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
            forward_output: false,
        });
        let transports: Arc<dyn TransportFactory> =
            Arc::new(|| -> Box<dyn MediaTransport> { Box::new(IdleTransport) });
        let actor = RegistryActor::new(
            cmd_rx,
            event_tx,
            CredentialStore::new(),
            settings(),
            supervisor,
            transports,
            metadata_tx,
        );
        (actor, event_rx)
    }

    fn url(id: &str) -> Url {
        Url::parse(&format!("rtsps://localhost:7001/{id}?enable_analytics_objects=true")).unwrap()
    }

    fn session(id: &str) -> Session {
        Session::new(DeviceId::new(id), url(id))
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let (mut actor, mut events) = create_actor("true");

        actor.handle_attach(session("cam1")).await.unwrap();
        assert_eq!(actor.device_count(), 1);
        assert!(matches!(events.try_recv().unwrap(), HostEvent::DeviceAttached { .. }));

        assert!(actor.handle_detach(&DeviceId::new("cam1")).await);
        assert_eq!(actor.device_count(), 0);
        assert!(matches!(events.try_recv().unwrap(), HostEvent::DeviceDetached { .. }));

        // Idempotent
        assert!(!actor.handle_detach(&DeviceId::new("cam1")).await);
    }

    #[tokio::test]
    async fn test_attach_replaces_session() {
        let (mut actor, _) = create_actor("true");
        actor.handle_attach(session("cam1")).await.unwrap();
        actor.handle_attach(Session::new(DeviceId::new("cam1"), url("cam1b"))).await.unwrap();

        assert_eq!(actor.device_count(), 1);
        let view = actor.session_view(&DeviceId::new("cam1")).unwrap();
        assert!(view.stream_url.contains("cam1b"));
    }

    #[tokio::test]
    async fn test_max_devices_limit() {
        let (mut actor, _) = create_actor("true");
        for i in 0..MAX_DEVICES {
            let id = format!("cam{i}");
            actor.handle_attach(session(&id)).await.unwrap();
        }

        let result = actor.handle_attach(session("overflow")).await;
        assert_eq!(result, Err(RegistryError::RegistryFull { max: MAX_DEVICES }));

        // Re-attaching a known id is still allowed at capacity.
        assert!(actor.handle_attach(session("cam0")).await.is_ok());
    }

    #[tokio::test]
    async fn test_media_started_unknown_device() {
        let (mut actor, _) = create_actor("true");
        let result = actor.handle_media_started(&DeviceId::new("ghost"));
        assert_eq!(result, Err(RegistryError::DeviceNotFound(DeviceId::new("ghost"))));
    }

    #[tokio::test]
    async fn test_credentials_restart_started_sessions_only() {
        let (mut actor, _) = create_actor("true");
        actor.handle_attach(session("cam1")).await.unwrap();
        actor.handle_attach(session("cam2")).await.unwrap();
        actor.handle_media_started(&DeviceId::new("cam1")).unwrap();

        // No credentials yet: started but idle.
        assert!(!actor.session_view(&DeviceId::new("cam1")).unwrap().reader_active);

        assert!(actor.handle_update_credentials(Credentials::new("a", "t")));
        assert!(actor.session_view(&DeviceId::new("cam1")).unwrap().reader_active);
        assert!(!actor.session_view(&DeviceId::new("cam2")).unwrap().reader_active);

        // Same value again changes nothing.
        assert!(!actor.handle_update_credentials(Credentials::new("a", "t")));

        actor.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_analytics_requires_device() {
        let (mut actor, mut events) = create_actor("true");
        let event = AnalyticsEvent::new("person").with_caption("Person");

        let result = actor.handle_push_analytics(DeviceId::new("cam1"), event.clone());
        assert!(matches!(result, Err(RegistryError::DeviceNotFound(_))));

        actor.handle_attach(session("cam1")).await.unwrap();
        let _ = events.try_recv();
        actor.handle_push_analytics(DeviceId::new("cam1"), event.clone()).unwrap();

        match events.try_recv().unwrap() {
            HostEvent::Analytics { device_id, event: got, .. } => {
                assert_eq!(device_id.as_str(), "cam1");
                assert_eq!(got, event);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_capability_warns_once() {
        let (mut actor, mut events) = create_actor("/nonexistent/worker");

        actor.handle_peer_info(PeerInfo::new(7001, false)).await;
        actor.handle_peer_info(PeerInfo::new(7002, false)).await;

        match events.try_recv().unwrap() {
            HostEvent::Diagnostic(d) => assert_eq!(d.caption, "Nx AI Manager not found"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(actor.peer_info.map(|p| p.port), Some(7001));
        assert!(actor.worker_started);
    }

    #[tokio::test]
    async fn test_worker_spawn_failure_reports_error() {
        let (mut actor, mut events) = create_actor("/nonexistent/worker");
        actor.handle_peer_info(PeerInfo::new(7001, true)).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            HostEvent::Diagnostic(d) => assert_eq!(d.caption, "Web Application failed to start"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_control_before_start() {
        let (mut actor, _) = create_actor("true");
        assert_eq!(actor.handle_stop_worker().await, Err(RegistryError::WorkerNotStarted));
        assert_eq!(actor.handle_restart_worker().await, Err(RegistryError::WorkerNotStarted));
    }

    #[tokio::test]
    async fn test_run_shutdown_responds() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (actor, _) = create_actor("true");
        let actor = RegistryActor { receiver: cmd_rx, ..actor };
        let task = tokio::spawn(actor.run());

        let (tx, rx) = oneshot::channel();
        cmd_tx.send(RegistryCommand::Shutdown { respond_to: tx }).await.unwrap();
        rx.await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_derived_urls_follow_discovered_port() {
        let (mut actor, _) = create_actor("/nonexistent/worker");
        actor.handle_attach_derived(DeviceId::new("{cam1}")).await.unwrap();
        actor.handle_attach(session("cam2")).await.unwrap();

        let view = actor.session_view(&DeviceId::new("{cam1}")).unwrap();
        assert!(view.derived_url);
        assert_eq!(
            view.stream_url,
            "rtsps://localhost:7001/cam1?enable_analytics_objects=true"
        );

        actor.handle_peer_info(PeerInfo::new(7443, true)).await;

        let view = actor.session_view(&DeviceId::new("{cam1}")).unwrap();
        assert_eq!(
            view.stream_url,
            "rtsps://localhost:7443/cam1?enable_analytics_objects=true"
        );
        // Explicit URLs are left alone.
        let view = actor.session_view(&DeviceId::new("cam2")).unwrap();
        assert!(view.stream_url.starts_with("rtsps://localhost:7001/"));

        // Attached after discovery: built on the known port directly.
        actor.handle_attach_derived(DeviceId::new("cam3")).await.unwrap();
        let view = actor.session_view(&DeviceId::new("cam3")).unwrap();
        assert!(view.stream_url.starts_with("rtsps://localhost:7443/cam3"));

        actor.shutdown().await;
    }
}
