//! Local control API.
//!
//! A loopback HTTP server on an ephemeral port. The worker learns the port
//! from its launch arguments and uses it to push events and credentials.
//!
//! | Method | Path                          | Outcome                         |
//! |--------|-------------------------------|---------------------------------|
//! | POST   | `/plugin/sendDiagEvent`       | 200, 400 invalid                |
//! | POST   | `/plugin/token`               | 200, 400 malformed, 422 empty   |
//! | POST   | `/device/{device_id}/sendEvent` | 200, 404 unknown, 400 invalid |
//! | GET    | `/device/listActive`          | 200 with a JSON array of ids    |
//!
//! The listener is bound before the registry exists so its port can be
//! passed to the worker; serving starts once the registry is up.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Handler failures map to status codes, never to a crashed task

mod error;
mod handlers;

pub use error::ApiError;

use std::net::{Ipv4Addr, SocketAddr};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::registry::RegistryHandle;

/// Builds the control API router.
pub fn router(registry: RegistryHandle) -> Router {
    Router::new()
        .route("/plugin/sendDiagEvent", post(handlers::send_diag_event))
        .route("/plugin/token", post(handlers::update_token))
        .route(
            "/device/{device_id}/sendEvent",
            post(handlers::send_device_event),
        )
        .route("/device/listActive", get(handlers::list_active))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind control API: {0}")]
    Bind(std::io::Error),

    #[error("control API failed: {0}")]
    Serve(std::io::Error),
}

/// The bound control API listener.
pub struct ControlApiServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ControlApiServer {
    /// Binds an ephemeral port on 127.0.0.1.
    pub async fn bind() -> Result<Self, ServerError> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(addr = %local_addr, "Control API bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Serves requests until `cancel_token` fires.
    pub async fn run(
        self,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "Control API listening");

        axum::serve(self.listener, router(registry))
            .with_graceful_shutdown(async move { cancel_token.cancelled().await })
            .await
            .map_err(ServerError::Serve)?;

        info!("Control API stopped");
        Ok(())
    }
}
