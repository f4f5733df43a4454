//! Facts learned about the peer (host media server) via capability discovery.

use serde::{Deserialize, Serialize};

/// Port assumed for the peer before discovery completes.
pub const DEFAULT_PEER_PORT: u16 = 7001;

/// Descriptor key whose presence marks the analytics manager as installed.
pub const ANALYTICS_CAPABILITY_KEY: &str = "nx.nxai";

/// Network location and capability of the peer.
///
/// Populated once by the first successful discovery and immutable
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub port: u16,
    pub capability_present: bool,
}

impl PeerInfo {
    pub fn new(port: u16, capability_present: bool) -> Self {
        Self {
            port,
            capability_present,
        }
    }
}
