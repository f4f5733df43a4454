//! CrowdPulse Core - Shared domain types for the camera control plane
//!
//! This crate provides the domain types shared between the wire
//! protocol (crowdpulse-protocol) and the daemon (crowdpulsed).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod credentials;
pub mod device;
pub mod error;
pub mod event;
pub mod peer;

// Re-exports for convenience
pub use credentials::{CredentialStore, Credentials};
pub use device::{stream_url_for, DeviceId, METADATA_QUERY};
pub use error::{DomainError, DomainResult};
pub use event::{AnalyticsEvent, DiagnosticEvent, DiagnosticLevel};
pub use peer::{PeerInfo, DEFAULT_PEER_PORT, ANALYTICS_CAPABILITY_KEY};
