//! Media transport abstraction.
//!
//! The stream reader only needs a handful of operations from a media
//! session: open it, start playback, read interleaved frames and close it.
//! Putting them behind a trait keeps the reconnect logic testable with
//! scripted in-memory transports.

use async_trait::async_trait;
use crowdpulse_core::Credentials;
use thiserror::Error;
use url::Url;

/// RTP payload type the peer assigns to the analytics metadata track.
pub const METADATA_PAYLOAD_TYPE: u8 = 103;

/// Codec name the peer advertises for the metadata track.
pub const METADATA_CODEC: &str = "t140";

/// One track announced by the peer when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    /// RTP payload type from the track's `rtpmap`.
    pub payload_type: u8,
    /// Codec name, lowercased.
    pub codec: String,
    /// Interleaved channel carrying the track's RTP packets.
    pub channel: u8,
}

impl TrackInfo {
    pub fn new(payload_type: u8, codec: impl Into<String>, channel: u8) -> Self {
        Self {
            payload_type,
            codec: codec.into().to_ascii_lowercase(),
            channel,
        }
    }

    /// Whether this is the analytics metadata track.
    pub fn is_metadata(&self) -> bool {
        self.payload_type == METADATA_PAYLOAD_TYPE && self.codec == METADATA_CODEC
    }
}

/// Errors raised by a media transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The URL asks for something this transport cannot do.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No data within the read deadline.
    #[error("timed out")]
    Timeout,

    /// The session is not open.
    #[error("transport closed")]
    Closed,

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A media session the stream reader pulls frames from.
///
/// Implementations are driven by a single task; none of the methods are
/// called concurrently.
#[async_trait]
pub trait MediaTransport: Send {
    /// Opens the session and returns the tracks the peer offers.
    async fn open(&mut self, url: &Url, credentials: &Credentials)
        -> Result<Vec<TrackInfo>, TransportError>;

    /// Starts live playback of an opened session.
    async fn play(&mut self) -> Result<(), TransportError>;

    /// Whether the session is currently usable.
    fn is_open(&self) -> bool;

    /// Reads one interleaved frame (4-byte header included) into `buf`.
    ///
    /// Returns the number of bytes written. `Ok(0)` means the peer closed
    /// the session.
    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Closes the session. Safe to call on a closed transport.
    async fn close(&mut self);
}

/// Creates a fresh transport for every reader.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn MediaTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Box<dyn MediaTransport> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn MediaTransport> {
        self()
    }
}
