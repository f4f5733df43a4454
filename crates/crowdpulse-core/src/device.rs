//! Device identity and stream addressing.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{DomainError, DomainResult};

/// Query appended to every device stream URL so the peer multiplexes
/// the analytics metadata track into the session.
pub const METADATA_QUERY: &str = "enable_analytics_objects=true";

/// Identifier of a camera attached by the host.
///
/// The host hands out ids in braced GUID form (`{a1b2...}`); the braces
/// are kept here and only stripped when building a stream path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the id with any `{`/`}` removed.
    #[must_use]
    pub fn unbraced(&self) -> String {
        self.0.replace(['{', '}'], "")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds the secure stream URL the peer serves for a device.
///
/// Format: `rtsps://localhost:<port>/<id without braces>?enable_analytics_objects=true`
pub fn stream_url_for(device_id: &DeviceId, peer_port: u16) -> DomainResult<Url> {
    let raw = format!(
        "rtsps://localhost:{peer_port}/{}?{METADATA_QUERY}",
        device_id.unbraced()
    );
    Url::parse(&raw).map_err(|e| DomainError::InvalidStreamUrl {
        device_id: device_id.clone(),
        reason: e.to_string(),
    })
}
