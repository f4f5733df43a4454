//! RTSP over TCP or TLS with interleaved RTP.
//!
//! Implements just enough of RTSP/1.0 to pull the analytics track from the
//! peer: `DESCRIBE`, one `SETUP` per offered track with interleaved
//! channels, `PLAY` and `TEARDOWN`. `rtsps` URLs run the same exchange over
//! TLS. Requests carry the shared credentials as a bearer token plus the
//! peer's user name and runtime token headers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use crowdpulse_core::Credentials;
use crowdpulse_protocol::{INTERLEAVED_HEADER_LEN, INTERLEAVED_MAGIC};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};
use url::Url;

use super::tls;
use super::transport::{MediaTransport, TrackInfo, TransportError, TransportFactory};

const DEFAULT_RTSP_PORT: u16 = 554;
const DEFAULT_RTSPS_PORT: u16 = 322;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const TEARDOWN_WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const USER_AGENT: &str = concat!("crowdpulsed/", env!("CARGO_PKG_VERSION"));

/// Header carrying the user name.
pub const USER_NAME_HEADER: &str = "X-Nx-User-Name";
/// Header carrying the runtime token.
pub const RUNTIME_GUID_HEADER: &str = "X-runtime-guid";

/// Byte stream a session runs over.
trait RtspIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RtspIo for T {}

type RtspStream = BufReader<Box<dyn RtspIo>>;

/// A parsed RTSP response.
#[derive(Debug, Default)]
struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// An SDP media section with its control attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SdpTrack {
    payload_type: u8,
    codec: String,
    control: Option<String>,
}

/// RTSP client session.
#[derive(Default)]
pub struct RtspTransport {
    stream: Option<RtspStream>,
    base_url: Option<Url>,
    session: Option<String>,
    auth_headers: Vec<(&'static str, String)>,
    cseq: u32,
}

impl fmt::Debug for RtspTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtspTransport")
            .field("open", &self.stream.is_some())
            .field("base_url", &self.base_url)
            .field("session", &self.session)
            .field("cseq", &self.cseq)
            .finish_non_exhaustive()
    }
}

impl RtspTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders a request and advances the sequence number.
    fn render(&mut self, method: &str, url: &str, extra: &[(&str, String)]) -> String {
        self.cseq += 1;

        let mut message = format!(
            "{method} {url} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {USER_AGENT}\r\n",
            self.cseq
        );
        for (name, value) in &self.auth_headers {
            message.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(session) = &self.session {
            message.push_str(&format!("Session: {session}\r\n"));
        }
        for (name, value) in extra {
            message.push_str(&format!("{name}: {value}\r\n"));
        }
        message.push_str("\r\n");
        message
    }

    async fn request(
        &mut self,
        method: &str,
        url: &str,
        extra: &[(&str, String)],
    ) -> Result<Response, TransportError> {
        let message = self.render(method, url, extra);

        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        trace!(method, url, "RTSP request");
        let io = stream.get_mut();
        io.write_all(message.as_bytes()).await?;
        io.flush().await?;

        let response = timeout(RESPONSE_TIMEOUT, read_response(stream, None))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if response.status != 200 {
            return Err(TransportError::Protocol(format!(
                "{method} returned {}",
                response.status
            )));
        }
        Ok(response)
    }

    fn control_url(&self, control: Option<&str>) -> Result<String, TransportError> {
        let base = self.base_url.as_ref().ok_or(TransportError::Closed)?;
        Ok(match control {
            None | Some("*") => base.to_string(),
            Some(c) if c.starts_with("rtsp://") || c.starts_with("rtsps://") => c.to_string(),
            Some(c) => {
                let mut url = base.clone();
                let path = format!("{}/{}", url.path().trim_end_matches('/'), c);
                url.set_path(&path);
                url.to_string()
            }
        })
    }
}

/// Connects to the URL's host, wrapping the socket in TLS for `rtsps`.
async fn connect(url: &Url) -> Result<Box<dyn RtspIo>, TransportError> {
    let secure = match url.scheme() {
        "rtsp" => false,
        "rtsps" => true,
        other => return Err(TransportError::Unsupported(format!("scheme {other}"))),
    };
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| TransportError::Protocol("url has no host".to_string()))?;
    let port = url
        .port()
        .unwrap_or(if secure { DEFAULT_RTSPS_PORT } else { DEFAULT_RTSP_PORT });

    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    tcp.set_nodelay(true)?;

    if !secure {
        return Ok(Box::new(tcp));
    }

    let connector = tls::insecure_connector()?;
    let tls = timeout(CONNECT_TIMEOUT, connector.connect(tls::server_name(host)?, tcp))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Connect(format!("tls handshake: {e}")))?;
    Ok(Box::new(tls))
}

#[async_trait]
impl MediaTransport for RtspTransport {
    async fn open(
        &mut self,
        url: &Url,
        credentials: &Credentials,
    ) -> Result<Vec<TrackInfo>, TransportError> {
        self.close().await;

        let stream = connect(url).await?;

        self.stream = Some(BufReader::new(stream));
        self.base_url = Some(url.clone());
        self.auth_headers = if credentials.is_valid() {
            vec![
                ("Authorization", format!("Bearer {}", credentials.token)),
                (USER_NAME_HEADER, credentials.user.clone()),
                (RUNTIME_GUID_HEADER, credentials.token.clone()),
            ]
        } else {
            Vec::new()
        };

        let describe = self
            .request(
                "DESCRIBE",
                url.as_str(),
                &[("Accept", "application/sdp".to_string())],
            )
            .await?;

        if let Some(base) = describe
            .header("Content-Base")
            .and_then(|b| Url::parse(b).ok())
        {
            self.base_url = Some(base);
        }

        let sdp = String::from_utf8_lossy(&describe.body);
        let offered = parse_sdp(&sdp);
        debug!(url = %url, tracks = offered.len(), "Stream described");

        let mut tracks = Vec::with_capacity(offered.len());
        for (index, track) in offered.iter().enumerate() {
            let channel = u8::try_from(index * 2)
                .map_err(|_| TransportError::Protocol("too many tracks".to_string()))?;
            let target = self.control_url(track.control.as_deref())?;
            let transport = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                channel,
                channel.saturating_add(1)
            );

            let setup = self.request("SETUP", &target, &[("Transport", transport)]).await?;
            if self.session.is_none() {
                self.session = setup
                    .header("Session")
                    .and_then(|s| s.split(';').next())
                    .map(|s| s.trim().to_string());
            }

            tracks.push(TrackInfo::new(track.payload_type, track.codec.clone(), channel));
        }

        Ok(tracks)
    }

    async fn play(&mut self) -> Result<(), TransportError> {
        let target = self.control_url(None)?;
        self.request("PLAY", &target, &[]).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match timeout(READ_TIMEOUT, read_interleaved(stream, buf)).await {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(e)) => {
                self.stream = None;
                Err(e)
            }
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&mut self) {
        if self.stream.is_some() {
            if let Ok(target) = self.control_url(None) {
                let message = self.render("TEARDOWN", &target, &[]);
                if let Some(stream) = self.stream.as_mut() {
                    // The reply is never read; the connection is dropped next.
                    let io = stream.get_mut();
                    let sent = async {
                        io.write_all(message.as_bytes()).await?;
                        io.flush().await
                    };
                    let _ = timeout(TEARDOWN_WRITE_TIMEOUT, sent).await;
                }
            }
        }
        self.stream = None;
        self.session = None;
        self.base_url = None;
    }
}

/// Creates an [`RtspTransport`] per reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtspTransportFactory;

impl TransportFactory for RtspTransportFactory {
    fn create(&self) -> Box<dyn MediaTransport> {
        Box::new(RtspTransport::new())
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

/// Reads one RTSP response. `first` is a byte already consumed from the
/// status line.
async fn read_response(
    stream: &mut RtspStream,
    first: Option<u8>,
) -> Result<Response, TransportError> {
    let mut status_line = String::new();
    if let Some(b) = first {
        status_line.push(char::from(b));
    }
    if stream.read_line(&mut status_line).await? == 0 {
        return Err(TransportError::Closed);
    }

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("bad status line: {}", status_line.trim())))?;

    let mut response = Response {
        status,
        ..Response::default()
    };

    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Err(TransportError::Closed);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            response
                .headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = response
        .header("Content-Length")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(0);
    if length > 0 {
        response.body = vec![0; length];
        stream.read_exact(&mut response.body).await?;
    }

    Ok(response)
}

/// Reads the next interleaved frame into `buf`, skipping RTSP responses
/// and oversized frames.
async fn read_interleaved(
    stream: &mut RtspStream,
    buf: &mut [u8],
) -> Result<usize, TransportError> {
    loop {
        let mut magic = [0u8; 1];
        if stream.read(&mut magic).await? == 0 {
            return Ok(0);
        }

        match magic[0] {
            INTERLEAVED_MAGIC => {
                let mut header = [0u8; 3];
                stream.read_exact(&mut header).await?;
                let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
                let total = INTERLEAVED_HEADER_LEN + len;

                let Some(target) = buf.get_mut(..total) else {
                    debug!(len, "Skipping oversized interleaved frame");
                    let mut sink = vec![0; len];
                    stream.read_exact(&mut sink).await?;
                    continue;
                };

                target[0] = INTERLEAVED_MAGIC;
                target[1..INTERLEAVED_HEADER_LEN].copy_from_slice(&header);
                stream.read_exact(&mut target[INTERLEAVED_HEADER_LEN..]).await?;
                return Ok(total);
            }
            b'R' => {
                let response = read_response(stream, Some(b'R')).await?;
                trace!(status = response.status, "Skipped in-band RTSP response");
            }
            _ => {}
        }
    }
}

/// Extracts media sections from an SDP description.
fn parse_sdp(sdp: &str) -> Vec<SdpTrack> {
    let mut tracks: Vec<SdpTrack> = Vec::new();

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            // m=<media> <port> <proto> <fmt> ...
            let payload_type = media
                .split_whitespace()
                .nth(3)
                .and_then(|pt| pt.parse().ok())
                .unwrap_or_default();
            tracks.push(SdpTrack {
                payload_type,
                codec: String::new(),
                control: None,
            });
            continue;
        }

        let Some(track) = tracks.last_mut() else {
            continue;
        };

        if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:<pt> <codec>/<clock>
            let mut parts = rtpmap.split_whitespace();
            let pt = parts.next().and_then(|pt| pt.parse::<u8>().ok());
            if pt == Some(track.payload_type) {
                if let Some(codec) = parts.next().and_then(|c| c.split('/').next()) {
                    track.codec = codec.to_ascii_lowercase();
                }
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            track.control = Some(control.to_string());
        }
    }

    tracks
}
