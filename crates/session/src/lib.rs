//! Per-tunnel multiplexing session for the DOtunnel relay.
//!
//! A [`TunnelSession`] terminates a single agent control socket and fans
//! public HTTP and WebSocket traffic into it as multiplexed streams. The
//! session is transport-agnostic: the front door feeds it decoded socket
//! events ([`TunnelSession::agent_frame`], [`TunnelSession::agent_closed`])
//! and drains [`AgentOutbound`] messages into the real socket, so the whole
//! state machine can be driven in tests without opening a connection.
//!
//! All session state lives behind one short-held lock; socket and body I/O
//! run in independent tasks that talk to the session through channels.

mod control;
mod http;
mod registry;
mod session;
mod streams;
mod ws;

use std::time::Duration;

pub use http::{PublicRequest, PublicResponse, RequestBody, ServeError, StreamAbort};
pub use registry::{NullRegistry, RegistryError, TunnelRecord, TunnelRegistry, TunnelStatus};
pub use session::{AgentOutbound, SessionError, TunnelSession};
pub use ws::{PublicWsEvent, UpgradeDecision, UpgradeTicket, WsPipe};

/// Tunable per-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cap on `|HTTP| + |WS|` streams in flight.
    pub max_concurrent_streams: usize,
    /// Deadline for an HTTP exchange and for a WebSocket upgrade.
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: dotunnel_protocol::DEFAULT_MAX_CONCURRENT_STREAMS,
            request_timeout: dotunnel_protocol::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}
