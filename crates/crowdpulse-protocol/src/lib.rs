//! CrowdPulse Protocol - Wire formats for the control plane
//!
//! This crate provides parsing for:
//! - JSON bodies pushed by the worker to the local control API
//! - The peer's server-description response used for capability discovery
//! - Interleaved RTP framing of the metadata sub-channel

pub mod frame;
pub mod parse;

pub use frame::{
    decode_metadata_frame, rtp_payload, FrameDecode, INTERLEAVED_HEADER_LEN, INTERLEAVED_MAGIC,
    RTP_FIXED_HEADER_LEN,
};
pub use parse::{
    parse_analytics_event, parse_credentials, parse_diagnostic_event, parse_server_info,
    ParseError, RawServerInfo,
};
