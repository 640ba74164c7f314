//! DOtunnel relay: the public front door and the agent control plane.
//!
//! Routes `*.{base}` hosts to their tunnel sessions by subdomain, serves
//! the agent connect API under `/_api/tunnel/connect`, and bridges public
//! HTTP/WebSocket traffic into [`dotunnel_session::TunnelSession`]s.
//!
//! API paths are reserved on every host: a tunnel whose origin also exposes
//! `/_api/tunnel/connect` cannot shadow the relay's own endpoint.

mod api;
mod config;
mod public;
mod registry;
mod sessions;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub use config::{HostPattern, RelayConfig};
pub use registry::InMemoryRegistry;
pub use sessions::SessionMap;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<InMemoryRegistry>,
    pub sessions: Arc<SessionMap>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(InMemoryRegistry::default());
        let sessions = Arc::new(SessionMap::new(config.session.clone(), registry.clone()));
        Self {
            config,
            registry,
            sessions,
        }
    }
}

/// Builds the relay router: the agent API plus the host-routed fallback.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/_api/tunnel/connect",
            post(api::connect).get(api::attach),
        )
        .fallback(public::public_entry)
        .with_state(state)
}
