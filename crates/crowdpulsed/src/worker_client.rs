//! Outbound metadata delivery to the worker.
//!
//! Readers push decoded payloads onto the metadata channel; a single
//! forwarder task drains it and posts each line to the worker's
//! `/metadata` endpoint. Delivery is best effort: a worker that is down or
//! restarting simply misses those lines.

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use crate::reader::MetadataReceiver;

/// Path the worker accepts metadata on.
pub const METADATA_PATH: &str = "/metadata";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerClientError {
    #[error("invalid worker url: {0}")]
    InvalidUrl(String),

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// HTTP client for the worker's web application.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    metadata_url: Url,
}

impl WorkerClient {
    /// Creates a client for the worker at `base_url` (e.g. `http://localhost:5000`).
    pub fn new(base_url: &str) -> Result<Self, WorkerClientError> {
        let metadata_url = Url::parse(base_url)
            .and_then(|base| base.join(METADATA_PATH))
            .map_err(|e| WorkerClientError::InvalidUrl(e.to_string()))?;
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, metadata_url })
    }

    pub fn metadata_url(&self) -> &Url {
        &self.metadata_url
    }

    /// Posts every non-empty line of `metadata` as its own JSON request.
    ///
    /// Returns how many lines the worker accepted.
    pub async fn push_metadata(&self, metadata: &str) -> usize {
        let mut accepted = 0;
        for line in metadata.split('\n').filter(|l| !l.trim().is_empty()) {
            let result = self
                .http
                .post(self.metadata_url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(line.to_string())
                .send()
                .await;

            match result {
                Ok(res) if res.status().is_success() => accepted += 1,
                Ok(res) => debug!(status = %res.status(), "Worker rejected metadata"),
                Err(e) => trace!(error = %e, "Worker unreachable"),
            }
        }
        accepted
    }
}

/// Spawns the task draining `rx` into `client`.
///
/// Ends when cancelled or when every reader has dropped its sender.
pub fn spawn_metadata_forwarder(
    mut rx: MetadataReceiver,
    client: WorkerClient,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(url = %client.metadata_url(), "Metadata forwarder started");
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => item,
            };
            let Some(item) = item else { break };

            let accepted = client.push_metadata(&item.payload).await;
            trace!(device_id = %item.device_id, accepted, "Metadata forwarded");
        }
        debug!("Metadata forwarder stopped");
    })
}
