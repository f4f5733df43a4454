//! Peer capability discovery.
//!
//! Polls the video management server's self-description on a fixed period
//! until it answers with a usable port. Every failure, whether network or
//! parse, is logged and retried on the next tick; there is no backoff and
//! no attempt cap. The first success is handed to the registry, which
//! launches the worker.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Discovery errors are logged but never fatal

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crowdpulse_core::{Credentials, PeerInfo};
use crowdpulse_protocol::{parse_server_info, ParseError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::registry::RegistryHandle;

// ============================================================================
// Constants
// ============================================================================

/// Period between discovery attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Path of the server's self-description.
pub const SERVER_INFO_PATH: &str = "/rest/v3/servers/this";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during one discovery attempt.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The peer URL could not be used.
    #[error("invalid peer url: {0}")]
    InvalidUrl(String),

    /// The request did not complete.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The peer answered with a non-success status.
    #[error("unexpected status: {0}")]
    Status(u16),

    /// The response body was unusable.
    #[error("bad response: {0}")]
    Parse(#[from] ParseError),
}

// ============================================================================
// Sources
// ============================================================================

/// Something that can describe the peer.
#[async_trait]
pub trait PeerInfoSource: Send + Sync {
    async fn fetch(&self, credentials: &Credentials) -> Result<PeerInfo, DiscoveryError>;
}

/// Fetches peer info from the server's REST API.
///
/// The server uses a self-signed certificate on localhost, so certificate
/// verification is disabled.
#[derive(Debug, Clone)]
pub struct HttpPeerInfoSource {
    http: reqwest::Client,
    url: Url,
}

impl HttpPeerInfoSource {
    /// Creates a source for `base_url` (e.g. `https://localhost:7001`).
    pub fn new(base_url: &str) -> Result<Self, DiscoveryError> {
        let url = Url::parse(base_url)
            .and_then(|base| base.join(SERVER_INFO_PATH))
            .map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PeerInfoSource for HttpPeerInfoSource {
    async fn fetch(&self, credentials: &Credentials) -> Result<PeerInfo, DiscoveryError> {
        let mut request = self.http.get(self.url.clone());
        if credentials.is_valid() {
            request = request.bearer_auth(&credentials.token);
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(DiscoveryError::Status(res.status().as_u16()));
        }

        let body = res.bytes().await?;
        Ok(parse_server_info(&body)?)
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Retry-until-success discovery loop.
pub struct PeerPoller {
    source: Arc<dyn PeerInfoSource>,
    registry: RegistryHandle,
    interval: Duration,
}

impl PeerPoller {
    pub fn new(source: Arc<dyn PeerInfoSource>, registry: RegistryHandle) -> Self {
        Self {
            source,
            registry,
            interval: POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Polls until the peer answers, then reports to the registry.
    ///
    /// Returns `None` if cancelled first.
    pub async fn run(self, cancel: CancellationToken) -> Option<PeerInfo> {
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(attempts, "Peer discovery cancelled");
                    return None;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            attempts += 1;
            let credentials = self.registry.credentials();
            match self.source.fetch(&credentials).await {
                Ok(info) => {
                    info!(
                        port = info.port,
                        capability = info.capability_present,
                        attempts,
                        "Peer discovered"
                    );
                    if let Err(e) = self.registry.peer_info_discovered(info).await {
                        warn!(error = %e, "Registry unavailable for peer info");
                    }
                    return Some(info);
                }
                Err(DiscoveryError::Parse(e)) => {
                    warn!(attempts, error = %e, "Unusable peer description, retrying");
                }
                Err(e) => {
                    debug!(attempts, error = %e, "Peer discovery failed, retrying");
                }
            }
        }
    }

    /// Spawns [`run`](Self::run) on a task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Option<PeerInfo>> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::reader::{metadata_channel, RtspTransportFactory};
    use crate::registry::{spawn_registry, RegistrySettings};
    use crate::supervisor::{spawn_supervisor, SupervisorConfig};

    /// Replays scripted results; the last one repeats.
    struct ScriptedSource {
        results: Mutex<VecDeque<Result<PeerInfo, ()>>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl PeerInfoSource for ScriptedSource {
        async fn fetch(&self, _credentials: &Credentials) -> Result<PeerInfo, DiscoveryError> {
            *self.calls.lock().unwrap() += 1;
            let mut results = self.results.lock().unwrap();
            let next = if results.len() > 1 {
                results.pop_front()
            } else {
                results.front().cloned()
            };
            match next {
                Some(Ok(info)) => Ok(info),
                _ => Err(DiscoveryError::Status(503)),
            }
        }
    }

    fn registry() -> RegistryHandle {
        let supervisor = spawn_supervisor(SupervisorConfig {
            program: "/nonexistent/worker".to_string(),
            module: "flaskr".to_string(),
            restart_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
            forward_output: false,
        });
        let (metadata_tx, _) = metadata_channel();
        spawn_registry(
            RegistrySettings {
                work_dir: std::env::temp_dir(),
                web_app_port: 5000,
                control_api_port: 41000,
                auto_restart: false,
            },
            supervisor,
            Arc::new(RtspTransportFactory),
            metadata_tx,
        )
    }

    #[test]
    fn test_http_source_url() {
        let source = HttpPeerInfoSource::new("https://localhost:7001").unwrap();
        assert_eq!(
            source.url().as_str(),
            "https://localhost:7001/rest/v3/servers/this"
        );
        assert!(HttpPeerInfoSource::new("not a url").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let source = Arc::new(ScriptedSource {
            results: Mutex::new(VecDeque::from([
                Err(()),
                Err(()),
                Ok(PeerInfo::new(7001, true)),
            ])),
            calls: Mutex::new(0),
        });
        let registry = registry();
        let poller = PeerPoller::new(source.clone(), registry.clone());

        let found = poller.run(CancellationToken::new()).await;
        assert_eq!(found, Some(PeerInfo::new(7001, true)));
        assert_eq!(*source.calls.lock().unwrap(), 3);
        assert_eq!(registry.peer_info().await.unwrap(), Some(PeerInfo::new(7001, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_one_period_between_attempts() {
        let source = Arc::new(ScriptedSource {
            results: Mutex::new(VecDeque::from([Err(()), Ok(PeerInfo::new(7001, true))])),
            calls: Mutex::new(0),
        });
        let started = tokio::time::Instant::now();

        let found = PeerPoller::new(source, registry())
            .run(CancellationToken::new())
            .await;
        assert!(found.is_some());
        let elapsed = started.elapsed();
        assert!(elapsed >= POLL_INTERVAL * 2 && elapsed < POLL_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let source = Arc::new(ScriptedSource {
            results: Mutex::new(VecDeque::from([Err(())])),
            calls: Mutex::new(0),
        });
        let cancel = CancellationToken::new();
        let task = PeerPoller::new(source.clone(), registry())
            .with_interval(Duration::from_millis(100))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(550)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), None);
        assert_eq!(*source.calls.lock().unwrap(), 5);
    }
}
