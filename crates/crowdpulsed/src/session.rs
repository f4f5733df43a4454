//! Per-device session.
//!
//! A session pairs a device's stream URL with at most one running
//! [`StreamReader`]. The reader starts lazily on the device's first frame
//! when credentials exist, and is restarted whenever the credentials
//! change after streaming began. Restarts never wait for the old reader:
//! the replacement joins it on its own task.
//!
//! A URL built from the peer port is marked derived, and follows the port
//! once discovery reports it.
//!
//! Sessions are owned and mutated only by the registry actor.

use crowdpulse_core::{CredentialStore, DeviceId};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::reader::{MetadataSender, ReaderExit, ReaderHandle, StreamReader, TransportFactory};

/// What a session needs to spawn its reader.
pub struct ReaderContext<'a> {
    pub credentials: &'a CredentialStore,
    pub transports: &'a dyn TransportFactory,
    pub metadata_tx: &'a MetadataSender,
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub device_id: DeviceId,
    pub stream_url: String,
    pub derived_url: bool,
    pub started: bool,
    pub reader_active: bool,
}

/// Runtime state of one attached device.
#[derive(Debug)]
pub struct Session {
    id: DeviceId,
    stream_url: Url,
    derived_url: bool,
    started: bool,
    reader: Option<ReaderHandle>,
}

impl Session {
    pub fn new(id: DeviceId, stream_url: Url) -> Self {
        Self {
            id,
            stream_url,
            derived_url: false,
            started: false,
            reader: None,
        }
    }

    /// A session whose URL was built from the peer port.
    pub fn derived(id: DeviceId, stream_url: Url) -> Self {
        Self {
            derived_url: true,
            ..Self::new(id, stream_url)
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    pub fn has_derived_url(&self) -> bool {
        self.derived_url
    }

    /// Whether media has started flowing for this device.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether a reader task is currently alive.
    pub fn reader_active(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.is_finished())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            device_id: self.id.clone(),
            stream_url: self.stream_url.to_string(),
            derived_url: self.derived_url,
            started: self.started,
            reader_active: self.reader_active(),
        }
    }

    /// Handles the device's first frame. Later calls are no-ops.
    pub fn media_started(&mut self, ctx: &ReaderContext<'_>) {
        if self.started {
            return;
        }
        self.started = true;

        if ctx.credentials.get().is_valid() {
            self.start_reader(ctx);
        } else {
            debug!(device_id = %self.id, "Media started, waiting for credentials");
        }
    }

    /// Restarts the reader with the new credentials if streaming began.
    pub fn credentials_changed(&mut self, ctx: &ReaderContext<'_>) {
        if self.started {
            self.start_reader(ctx);
        }
    }

    /// Points the session at a new URL. A running reader is restarted
    /// against it. Returns whether the URL changed.
    pub fn retarget(&mut self, stream_url: Url, ctx: &ReaderContext<'_>) -> bool {
        if stream_url == self.stream_url {
            return false;
        }
        info!(device_id = %self.id, from = %self.stream_url, to = %stream_url, "Stream url changed");
        self.stream_url = stream_url;

        if self.reader.is_some() {
            self.start_reader(ctx);
        }
        true
    }

    /// Replaces the reader without waiting. The previous one is cancelled
    /// now and has fully exited before the new one opens its stream.
    pub fn start_reader(&mut self, ctx: &ReaderContext<'_>) {
        let credentials = ctx.credentials.get();
        info!(device_id = %self.id, user = %credentials.user, "Starting stream reader");
        self.reader = Some(StreamReader::spawn_replacing(
            self.reader.take(),
            self.id.clone(),
            self.stream_url.clone(),
            credentials,
            ctx.transports.create(),
            ctx.metadata_tx.clone(),
        ));
    }

    /// Stops the reader, if any, and waits for it to exit.
    pub async fn stop_reader(&mut self) -> Option<ReaderExit> {
        let reader = self.reader.take()?;
        let exit = reader.stop().await;
        debug!(device_id = %self.id, ?exit, "Stream reader exited");
        Some(exit)
    }
}
