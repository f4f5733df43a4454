//! Integration tests for the session registry.
//!
//! These drive `spawn_registry()` through `RegistryHandle` together with a
//! real supervisor, a fake media transport and, where it matters, the
//! metadata forwarder and peer poller.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::routing::post;
use axum::Router;
use crowdpulse_core::{Credentials, DeviceId, DiagnosticEvent, DiagnosticLevel, PeerInfo};
use crowdpulsed::discovery::{DiscoveryError, PeerInfoSource, PeerPoller};
use crowdpulsed::reader::{
    metadata_channel, MediaTransport, MetadataReceiver, TrackInfo, TransportError,
    TransportFactory,
};
use crowdpulsed::registry::{
    spawn_registry, HostEvent, RegistryError, RegistryHandle, RegistrySettings,
};
use crowdpulsed::supervisor::{spawn_supervisor, SupervisorConfig, SupervisorHandle};
use crowdpulsed::worker_client::{spawn_metadata_forwarder, WorkerClient};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

// ============================================================================
// Test Helpers
// ============================================================================

/// State shared by every transport the fake factory hands out.
#[derive(Default)]
struct Peer {
    frames: VecDeque<Vec<u8>>,
    opened_with: Vec<Credentials>,
    opened_urls: Vec<Url>,
    closes: usize,
    /// How long each close takes, like a peer slow to answer TEARDOWN.
    close_delay: Duration,
}

struct FakeTransport {
    peer: Arc<Mutex<Peer>>,
    open: bool,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn open(
        &mut self,
        url: &Url,
        credentials: &Credentials,
    ) -> Result<Vec<TrackInfo>, TransportError> {
        let mut peer = self.peer.lock().unwrap();
        peer.opened_with.push(credentials.clone());
        peer.opened_urls.push(url.clone());
        drop(peer);
        self.open = true;
        Ok(vec![TrackInfo::new(103, "t140", 2)])
    }

    async fn play(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            let next = self.peer.lock().unwrap().frames.pop_front();
            if let Some(frame) = next {
                buf[..frame.len()].copy_from_slice(&frame);
                return Ok(frame.len());
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn close(&mut self) {
        if self.open {
            let delay = self.peer.lock().unwrap().close_delay;
            sleep(delay).await;
            self.peer.lock().unwrap().closes += 1;
        }
        self.open = false;
    }
}

fn fake_factory() -> (Arc<dyn TransportFactory>, Arc<Mutex<Peer>>) {
    let peer = Arc::new(Mutex::new(Peer::default()));
    let shared = Arc::clone(&peer);
    let factory = move || -> Box<dyn MediaTransport> {
        Box::new(FakeTransport {
            peer: Arc::clone(&shared),
            open: false,
        })
    };
    (Arc::new(factory), peer)
}

/// An interleaved frame on channel 2 carrying one RTP packet.
fn metadata_frame(payload: &[u8]) -> Vec<u8> {
    let len = (12 + payload.len()) as u16;
    let mut out = vec![b'$', 2];
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&[0x80, 103, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1]);
    out.extend_from_slice(payload);
    out
}

fn write_worker_script(dir: &Path, body: &str) -> String {
    let path = dir.join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn supervisor(program: String) -> SupervisorHandle {
    spawn_supervisor(SupervisorConfig {
        program,
        module: "flaskr".to_string(),
        restart_delay: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
        forward_output: false,
    })
}

struct Harness {
    registry: RegistryHandle,
    supervisor: SupervisorHandle,
    peer: Arc<Mutex<Peer>>,
    metadata_rx: MetadataReceiver,
}

fn harness(program: String, work_dir: &Path) -> Harness {
    let supervisor = supervisor(program);
    let (transports, peer) = fake_factory();
    let (metadata_tx, metadata_rx) = metadata_channel();
    let registry = spawn_registry(
        RegistrySettings {
            work_dir: work_dir.to_path_buf(),
            web_app_port: 5000,
            control_api_port: 41234,
            auto_restart: false,
        },
        supervisor.clone(),
        transports,
        metadata_tx,
    );
    Harness {
        registry,
        supervisor,
        peer,
        metadata_rx,
    }
}

fn cam_url(id: &str) -> Url {
    Url::parse(&format!("rtsp://localhost:7001/{id}?enable_analytics_objects=true")).unwrap()
}

async fn next_diagnostic(events: &mut broadcast::Receiver<HostEvent>) -> DiagnosticEvent {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a diagnostic")
            .unwrap();
        if let HostEvent::Diagnostic(diag) = event {
            return diag;
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Peer info source answering from a fixed list, then repeating the last.
struct ListSource {
    responses: Mutex<VecDeque<Result<PeerInfo, DiscoveryError>>>,
    last: PeerInfo,
}

#[async_trait]
impl PeerInfoSource for ListSource {
    async fn fetch(&self, _credentials: &Credentials) -> Result<PeerInfo, DiscoveryError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.last))
    }
}

// ============================================================================
// Device Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_attach_list_detach() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    let mut events = h.registry.subscribe();

    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    h.registry.attach(DeviceId::new("cam2"), cam_url("cam2")).await.unwrap();

    let mut ids = h.registry.list_devices().await.unwrap();
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(ids, vec![DeviceId::new("cam1"), DeviceId::new("cam2")]);

    assert!(matches!(
        events.recv().await.unwrap(),
        HostEvent::DeviceAttached { device_id } if device_id.as_str() == "cam1"
    ));

    assert!(h.registry.detach(DeviceId::new("cam1")).await.unwrap());
    assert!(!h.registry.detach(DeviceId::new("cam1")).await.unwrap());
    assert_eq!(h.registry.list_devices().await.unwrap(), vec![DeviceId::new("cam2")]);

    assert!(h.registry.get_session(DeviceId::new("cam1")).await.unwrap().is_none());
    let view = h.registry.get_session(DeviceId::new("cam2")).await.unwrap().unwrap();
    assert_eq!(view.device_id.as_str(), "cam2");
    assert!(!view.started);
    assert!(!view.reader_active);
}

#[tokio::test]
async fn test_media_started_waits_for_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());

    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    h.registry.media_started(DeviceId::new("cam1")).await.unwrap();

    let view = h.registry.get_session(DeviceId::new("cam1")).await.unwrap().unwrap();
    assert!(view.started);
    assert!(!view.reader_active);
    assert!(h.peer.lock().unwrap().opened_with.is_empty());

    assert!(h
        .registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap());

    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_with.len() == 1).await;
    assert_eq!(
        h.peer.lock().unwrap().opened_with[0],
        Credentials::new("admin", "t1")
    );

    let view = h.registry.get_session(DeviceId::new("cam1")).await.unwrap().unwrap();
    assert!(view.reader_active);
}

#[tokio::test]
async fn test_media_started_unknown_device() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());

    let result = h.registry.media_started(DeviceId::new("ghost")).await;
    assert_eq!(result, Err(RegistryError::DeviceNotFound(DeviceId::new("ghost"))));
}

#[tokio::test]
async fn test_same_credentials_twice_restart_once() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    h.registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap();

    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    h.registry.media_started(DeviceId::new("cam1")).await.unwrap();

    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_with.len() == 1).await;

    assert!(h
        .registry
        .update_credentials(Credentials::new("admin", "t2"))
        .await
        .unwrap());
    assert!(!h
        .registry
        .update_credentials(Credentials::new("admin", "t2"))
        .await
        .unwrap());

    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_with.len() == 2).await;
    sleep(Duration::from_millis(100)).await;

    let peer = h.peer.lock().unwrap();
    assert_eq!(peer.opened_with.len(), 2);
    assert_eq!(peer.opened_with[1], Credentials::new("admin", "t2"));
    assert_eq!(h.registry.credentials(), Credentials::new("admin", "t2"));
}

#[tokio::test]
async fn test_analytics_event_requires_attached_device() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());

    let event = crowdpulse_core::AnalyticsEvent::new("person");
    let result = h
        .registry
        .push_analytics_event(DeviceId::new("cam1"), event.clone())
        .await;
    assert_eq!(result, Err(RegistryError::DeviceNotFound(DeviceId::new("cam1"))));

    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    let mut events = h.registry.subscribe();
    h.registry
        .push_analytics_event(DeviceId::new("cam1"), event)
        .await
        .unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        HostEvent::Analytics { device_id, .. } if device_id.as_str() == "cam1"
    ));
}

// ============================================================================
// Metadata Pipeline Tests
// ============================================================================

#[tokio::test]
async fn test_metadata_reaches_worker() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());

    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&received);
    let app = Router::new().route(
        "/metadata",
        post(move |body: Bytes| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(String::from_utf8_lossy(&body).into_owned());
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let cancel = CancellationToken::new();
    let forwarder = spawn_metadata_forwarder(
        h.metadata_rx,
        WorkerClient::new(&format!("http://{addr}")).unwrap(),
        cancel.clone(),
    );

    h.peer
        .lock()
        .unwrap()
        .frames
        .push_back(metadata_frame(b"{\"n\":1}\n{\"n\":2}\n"));

    h.registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap();
    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    h.registry.media_started(DeviceId::new("cam1")).await.unwrap();

    let sink = Arc::clone(&received);
    wait_until(|| sink.lock().unwrap().len() == 2).await;
    assert_eq!(*received.lock().unwrap(), vec!["{\"n\":1}", "{\"n\":2}"]);

    h.registry.shutdown().await.unwrap();
    cancel.cancel();
    forwarder.await.unwrap();
}

#[tokio::test]
async fn test_detach_stops_reader() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    h.registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap();
    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    h.registry.media_started(DeviceId::new("cam1")).await.unwrap();

    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_with.len() == 1).await;

    assert!(h.registry.detach(DeviceId::new("cam1")).await.unwrap());
    assert_eq!(h.peer.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_credential_update_does_not_stall_registry() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    h.registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap();

    let ids: Vec<DeviceId> = (1..=4).map(|i| DeviceId::new(format!("cam{i}"))).collect();
    for id in &ids {
        h.registry.attach(id.clone(), cam_url(id.as_str())).await.unwrap();
        h.registry.media_started(id.clone()).await.unwrap();
    }
    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_with.len() == 4).await;

    h.peer.lock().unwrap().close_delay = Duration::from_secs(1);

    let started = Instant::now();
    assert!(h
        .registry
        .update_credentials(Credentials::new("admin", "t2"))
        .await
        .unwrap());
    assert_eq!(h.registry.list_devices().await.unwrap().len(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(500), "registry stalled for {elapsed:?}");

    // Every reader comes back with the new token once its predecessor closed.
    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_with.len() == 8).await;
    {
        let peer = h.peer.lock().unwrap();
        assert_eq!(peer.closes, 4);
        assert!(peer.opened_with[4..]
            .iter()
            .all(|c| *c == Credentials::new("admin", "t2")));
    }

    h.peer.lock().unwrap().close_delay = Duration::ZERO;
    h.registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovered_port_retargets_derived_devices() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    h.registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap();

    h.registry.attach_derived(DeviceId::new("{cam1}")).await.unwrap();
    h.registry.attach(DeviceId::new("cam2"), cam_url("cam2")).await.unwrap();
    h.registry.media_started(DeviceId::new("{cam1}")).await.unwrap();

    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_urls.len() == 1).await;
    assert_eq!(h.peer.lock().unwrap().opened_urls[0].port(), Some(7001));

    h.registry
        .peer_info_discovered(PeerInfo::new(7443, true))
        .await
        .unwrap();

    let peer = Arc::clone(&h.peer);
    wait_until(|| peer.lock().unwrap().opened_urls.len() == 2).await;
    assert_eq!(
        h.peer.lock().unwrap().opened_urls[1].as_str(),
        "rtsps://localhost:7443/cam1?enable_analytics_objects=true"
    );

    let view = h
        .registry
        .get_session(DeviceId::new("{cam1}"))
        .await
        .unwrap()
        .unwrap();
    assert!(view.derived_url);
    assert!(view.reader_active);

    let view = h
        .registry
        .get_session(DeviceId::new("cam2"))
        .await
        .unwrap()
        .unwrap();
    assert!(!view.derived_url);
    assert_eq!(view.stream_url, cam_url("cam2").as_str());

    h.registry.shutdown().await.unwrap();
}

// ============================================================================
// Worker Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_peer_discovery_starts_worker_once() {
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args.txt");
    let program = write_worker_script(
        dir.path(),
        &format!("echo \"$@\" >> {}\nexec sleep 30", args_file.display()),
    );
    let h = harness(program, dir.path());
    let mut launches = h.supervisor.launches();

    assert_eq!(h.registry.stop_worker().await, Err(RegistryError::WorkerNotStarted));

    let source = Arc::new(ListSource {
        responses: Mutex::new(VecDeque::from([
            Err(DiscoveryError::Status(503)),
            Ok(PeerInfo::new(7001, true)),
        ])),
        last: PeerInfo::new(7001, true),
    });
    let poller = PeerPoller::new(source, h.registry.clone()).with_interval(Duration::from_millis(10));
    let found = poller.run(CancellationToken::new()).await;
    assert_eq!(found, Some(PeerInfo::new(7001, true)));

    timeout(Duration::from_secs(5), launches.wait_for(|n| *n == 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.registry.peer_info().await.unwrap(), Some(PeerInfo::new(7001, true)));

    // A second discovery is ignored.
    h.registry
        .peer_info_discovered(PeerInfo::new(9999, false))
        .await
        .unwrap();
    assert_eq!(h.registry.peer_info().await.unwrap(), Some(PeerInfo::new(7001, true)));

    let path = args_file.clone();
    wait_until(|| path.exists()).await;
    let args = std::fs::read_to_string(&args_file).unwrap();
    assert_eq!(
        args.trim(),
        "-m flaskr --web-app-port 5000 --crowdpulse-plugin-port 41234 --mediaserver-port 7001"
    );
    assert_eq!(*h.supervisor.launches().borrow(), 1);

    h.registry.stop_worker().await.unwrap();
    h.registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_capability_warns() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_worker_script(dir.path(), "exec sleep 30");
    let h = harness(program, dir.path());
    let mut events = h.registry.subscribe();

    h.registry
        .peer_info_discovered(PeerInfo::new(7001, false))
        .await
        .unwrap();

    let diag = next_diagnostic(&mut events).await;
    assert_eq!(diag.level, DiagnosticLevel::Warning);
    assert_eq!(diag.caption, "Nx AI Manager not found");

    h.registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_spawn_failure_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    let mut events = h.registry.subscribe();

    h.registry
        .peer_info_discovered(PeerInfo::new(7001, true))
        .await
        .unwrap();

    let diag = next_diagnostic(&mut events).await;
    assert_eq!(diag.level, DiagnosticLevel::Error);
    assert_eq!(diag.caption, "Web Application failed to start");
}

#[tokio::test]
async fn test_restart_worker_relaunches() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_worker_script(dir.path(), "exec sleep 30");
    let h = harness(program, dir.path());
    let mut launches = h.supervisor.launches();

    h.registry
        .peer_info_discovered(PeerInfo::new(7001, true))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), launches.wait_for(|n| *n == 1))
        .await
        .unwrap()
        .unwrap();

    h.registry.restart_worker().await.unwrap();
    timeout(Duration::from_secs(5), launches.wait_for(|n| *n == 2))
        .await
        .unwrap()
        .unwrap();

    h.registry.shutdown().await.unwrap();
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_disconnects_handle() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness("/nonexistent/worker".to_string(), dir.path());
    h.registry
        .update_credentials(Credentials::new("admin", "t1"))
        .await
        .unwrap();
    h.registry.attach(DeviceId::new("cam1"), cam_url("cam1")).await.unwrap();
    h.registry.media_started(DeviceId::new("cam1")).await.unwrap();

    h.registry.shutdown().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert!(!h.registry.is_connected());
    assert_eq!(
        h.registry.list_devices().await,
        Err(RegistryError::ChannelClosed)
    );
}
