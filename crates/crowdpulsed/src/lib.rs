//! CrowdPulse Daemon - per-camera control plane
//!
//! This crate provides the core infrastructure for the CrowdPulse daemon:
//! - `registry` - Session registry actor owning device sessions and credentials
//! - `session` - Per-device session state and its stream reader
//! - `reader` - Resilient metadata stream reader and media transports
//! - `supervisor` - Worker process supervisor with auto-restart
//! - `api` - Local control API the worker uses to push events and credentials
//! - `discovery` - Periodic peer capability discovery
//! - `worker_client` - Outbound metadata delivery to the worker
//! - `config` / `assets` - Startup configuration and worker bundle unpacking
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  commands   ┌────────────────────────────────┐
//! │ ControlApiServer │────────────▶│         RegistryActor          │
//! │  (127.0.0.1:0)   │             │ sessions, credentials, peer    │
//! └────────▲─────────┘             └───────┬───────────────┬────────┘
//!          │ events/token                  │ start/stop    │ start
//!          │                               ▼               ▼
//! ┌────────┴─────────┐  /metadata  ┌──────────────┐  ┌──────────────┐
//! │  worker process  │◀────────────│  forwarder   │◀─│ StreamReader │
//! │   (supervised)   │             └──────────────┘  │ (per device) │
//! └──────────────────┘                               └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod api;
pub mod assets;
pub mod config;
pub mod discovery;
pub mod reader;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod worker_client;
