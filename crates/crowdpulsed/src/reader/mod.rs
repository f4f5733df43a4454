//! Resilient metadata stream reader.
//!
//! One reader runs per started device session. It opens the device's media
//! session, selects the analytics metadata track and forwards every payload
//! on that track to the metadata channel. When the session drops it is
//! reopened; only a failure of the very first open ends the reader.
//!
//! ```text
//!   open ──fail──▶ OpenFailed (no retry)
//!    │ok
//!    ▼
//!   read ◀──────────────────────┐
//!    │ closed / 0 bytes / error │
//!    ▼                          │
//!   reopen ──ok─────────────────┘
//!    │fail
//!    └──▶ yield, reopen again
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport errors always lead to a reopen, never a crash
//! - A full metadata channel drops the payload with a warning

mod rtsp;
mod tls;
mod transport;

pub use rtsp::{RtspTransport, RtspTransportFactory, RUNTIME_GUID_HEADER, USER_NAME_HEADER};
pub use transport::{
    MediaTransport, TrackInfo, TransportError, TransportFactory, METADATA_CODEC,
    METADATA_PAYLOAD_TYPE,
};

use crowdpulse_core::{Credentials, DeviceId};
use crowdpulse_protocol::{decode_metadata_frame, FrameDecode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

// ============================================================================
// Constants
// ============================================================================

/// Frame buffer size. Larger interleaved frames are dropped by the transport.
pub const FRAME_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the metadata channel between readers and the forwarder.
pub const METADATA_BUFFER: usize = 256;

// ============================================================================
// Types
// ============================================================================

/// One metadata payload read from a device stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataItem {
    pub device_id: DeviceId,
    pub payload: String,
}

pub type MetadataSender = mpsc::Sender<MetadataItem>;
pub type MetadataReceiver = mpsc::Receiver<MetadataItem>;

/// Creates the metadata channel shared by all readers.
pub fn metadata_channel() -> (MetadataSender, MetadataReceiver) {
    mpsc::channel(METADATA_BUFFER)
}

/// How a reader task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Stopped on request.
    Stopped,
    /// The initial open failed; the reader gave up without retrying.
    OpenFailed,
    /// The task panicked or was aborted.
    Aborted,
}

// ============================================================================
// Stream Reader
// ============================================================================

/// The reader task's state. Created and consumed by [`StreamReader::spawn`].
pub struct StreamReader {
    device_id: DeviceId,
    url: Url,
    credentials: Credentials,
    transport: Box<dyn MediaTransport>,
    metadata_tx: MetadataSender,
    cancel: CancellationToken,
    channel: Option<u8>,
    buf: Vec<u8>,
}

impl StreamReader {
    /// Spawns a reader for `device_id` and returns its handle.
    pub fn spawn(
        device_id: DeviceId,
        url: Url,
        credentials: Credentials,
        transport: Box<dyn MediaTransport>,
        metadata_tx: MetadataSender,
    ) -> ReaderHandle {
        Self::spawn_replacing(None, device_id, url, credentials, transport, metadata_tx)
    }

    /// Spawns a reader that takes over from `previous` without blocking the
    /// caller.
    ///
    /// `previous` is cancelled immediately and joined inside the new task,
    /// so the new reader opens its stream only after the old one exited.
    pub fn spawn_replacing(
        previous: Option<ReaderHandle>,
        device_id: DeviceId,
        url: Url,
        credentials: Credentials,
        transport: Box<dyn MediaTransport>,
        metadata_tx: MetadataSender,
    ) -> ReaderHandle {
        if let Some(previous) = &previous {
            previous.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        let reader = Self {
            device_id: device_id.clone(),
            url,
            credentials,
            transport,
            metadata_tx,
            cancel: cancel.clone(),
            channel: None,
            buf: vec![0; FRAME_BUFFER_SIZE],
        };

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let exit = previous.stop().await;
                debug!(device_id = %reader.device_id, ?exit, "Previous stream reader exited");
            }
            reader.run().await
        });
        ReaderHandle {
            device_id,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self) -> ReaderExit {
        let cancel = self.cancel.clone();
        info!(device_id = %self.device_id, url = %self.url, "Stream reader starting");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.open_stream() => Some(opened),
        };

        match opened {
            None => {
                self.transport.close().await;
                return ReaderExit::Stopped;
            }
            Some(false) => {
                warn!(device_id = %self.device_id, "Initial stream open failed, reader exiting");
                self.transport.close().await;
                return ReaderExit::OpenFailed;
            }
            Some(true) => {}
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                payload = self.next_payload() => {
                    if let Some(payload) = payload {
                        self.deliver(payload);
                    }
                }
            }
        }

        self.transport.close().await;
        info!(device_id = %self.device_id, "Stream reader stopped");
        ReaderExit::Stopped
    }

    /// Opens the session, selects the metadata track and starts playback.
    async fn open_stream(&mut self) -> bool {
        self.channel = None;

        let tracks = match self.transport.open(&self.url, &self.credentials).await {
            Ok(tracks) => tracks,
            Err(e) => {
                debug!(device_id = %self.device_id, error = %e, "Failed to open stream");
                return false;
            }
        };

        let Some(track) = tracks.iter().find(|t| t.is_metadata()) else {
            debug!(
                device_id = %self.device_id,
                tracks = tracks.len(),
                "No metadata track offered"
            );
            return false;
        };
        let channel = track.channel;

        if let Err(e) = self.transport.play().await {
            debug!(device_id = %self.device_id, error = %e, "Failed to start playback");
            return false;
        }

        self.channel = Some(channel);
        debug!(device_id = %self.device_id, channel, "Metadata track selected");
        true
    }

    /// Closes and reopens the session, retrying until it succeeds.
    async fn reopen(&mut self) {
        loop {
            self.transport.close().await;
            if self.open_stream().await {
                info!(device_id = %self.device_id, "Stream reopened");
                return;
            }
            // Let cancellation and other tasks run between attempts.
            tokio::task::yield_now().await;
        }
    }

    /// Reads one frame and returns its metadata payload, if any.
    async fn next_payload(&mut self) -> Option<String> {
        let channel = match self.channel {
            Some(channel) if self.transport.is_open() => channel,
            _ => {
                debug!(device_id = %self.device_id, "Stream not open, reopening");
                self.reopen().await;
                return None;
            }
        };

        let len = match self.transport.read_frame(&mut self.buf).await {
            Ok(0) => {
                debug!(device_id = %self.device_id, "Stream ended, reopening");
                self.reopen().await;
                return None;
            }
            Ok(len) => len,
            Err(e) => {
                debug!(device_id = %self.device_id, error = %e, "Read failed, reopening");
                self.reopen().await;
                return None;
            }
        };

        let frame = self.buf.get(..len)?;
        match decode_metadata_frame(frame, channel) {
            FrameDecode::Payload(payload) if !payload.is_empty() => {
                Some(String::from_utf8_lossy(payload).into_owned())
            }
            FrameDecode::Payload(_) | FrameDecode::OtherChannel(_) => None,
            FrameDecode::TooShort => {
                trace!(device_id = %self.device_id, len, "Dropping short frame");
                None
            }
            FrameDecode::Malformed => {
                trace!(device_id = %self.device_id, len, "Dropping malformed RTP packet");
                None
            }
        }
    }

    fn deliver(&self, payload: String) {
        let item = MetadataItem {
            device_id: self.device_id.clone(),
            payload,
        };
        match self.metadata_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(device_id = %self.device_id, "Metadata channel full, dropping payload");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(device_id = %self.device_id, "Metadata channel closed");
            }
        }
    }
}

// ============================================================================
// Reader Handle
// ============================================================================

/// Owner's handle to a running reader.
///
/// Dropping the handle cancels the reader without waiting for it.
#[derive(Debug)]
pub struct ReaderHandle {
    device_id: DeviceId,
    cancel: CancellationToken,
    task: Option<JoinHandle<ReaderExit>>,
}

impl ReaderHandle {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Whether the reader task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the reader and waits for it to exit.
    ///
    /// Once this returns the reader delivers nothing more.
    pub async fn stop(mut self) -> ReaderExit {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return ReaderExit::Stopped;
        };
        match task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "Stream reader task failed");
                ReaderExit::Aborted
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
