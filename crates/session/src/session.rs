//! The session supervisor: owns the agent socket and every stream.
//!
//! At most one agent socket is open per session. A second attach displaces
//! the first: the old socket gets `goAway` + close(1000), every in-flight
//! stream fails with "CLI reconnected", and the connection id rotates with
//! counters reset. All in-flight streams are failed before the new attach
//! can see its first frame.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use dotunnel_protocol::{
    wire, AbortReason, ControlFrame, Envelope, FrameBody, TunnelReady,
};

use crate::http::{ServeError, StreamAbort};
use crate::registry::{TunnelRegistry, TunnelStatus};
use crate::streams::{HttpStreamEntry, StreamTable, WsStreamEntry};
use crate::ws::{PublicWsEvent, UpgradeDecision};
use crate::SessionConfig;

/// Messages the front door writes to the agent socket on the session's
/// behalf. Only the handshake is text; everything else is a binary frame.
#[derive(Debug)]
pub enum AgentOutbound {
    Text(String),
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Fatal failure of the agent connection.
///
/// Returned from [`TunnelSession::agent_frame`] so the read pump stops;
/// by the time the caller sees this the session has already closed the
/// socket and failed all streams.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One per tunnel: the multiplexing state machine between a single agent
/// control socket and many public client connections.
pub struct TunnelSession {
    tunnel_id: String,
    tunnel_url: String,
    pub(crate) config: SessionConfig,
    registry: Arc<dyn TunnelRegistry>,
    pub(crate) state: Mutex<SessionState>,
}

pub(crate) struct SessionState {
    pub agent: Option<mpsc::UnboundedSender<AgentOutbound>>,
    pub connection_id: u64,
    pub next_msg_seq: u32,
    /// Set on inbound goAway; refuses new streams while existing ones drain.
    pub draining: bool,
    pub table: StreamTable,
}

impl SessionState {
    /// Assigns the next `msg_seq` and enqueues one encoded frame on the
    /// agent socket. Returns false when no agent is attached.
    ///
    /// Called only under the session lock, so `msg_seq` reflects global
    /// emission order across streams.
    pub fn send_frame(&mut self, stream_id: u32, body: FrameBody) -> bool {
        let Some(agent) = &self.agent else {
            return false;
        };
        let msg_seq = self.next_msg_seq;
        self.next_msg_seq += 1;
        let envelope = Envelope::new(self.connection_id, stream_id, msg_seq, body);
        agent
            .send(AgentOutbound::Frame(wire::encode(&envelope)))
            .is_ok()
    }
}

impl TunnelSession {
    pub fn new(
        tunnel_id: impl Into<String>,
        tunnel_url: impl Into<String>,
        config: SessionConfig,
        registry: Arc<dyn TunnelRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id: tunnel_id.into(),
            tunnel_url: tunnel_url.into(),
            config,
            registry,
            state: Mutex::new(SessionState {
                agent: None,
                connection_id: 0,
                next_msg_seq: 0,
                draining: false,
                table: StreamTable::new(),
            }),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }

    /// Whether an agent socket is currently attached.
    pub fn is_online(&self) -> bool {
        self.state.lock().agent.is_some()
    }

    /// `(HTTP, WebSocket)` in-flight stream counts.
    pub fn stream_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.table.http.len(), state.table.ws.len())
    }

    pub fn connection_id(&self) -> u64 {
        self.state.lock().connection_id
    }

    // -----------------------------------------------------------------------
    // Agent socket lifecycle
    // -----------------------------------------------------------------------

    /// Adopts a new agent socket, displacing any previous one.
    ///
    /// Returns the rotated connection id. The handshake has already been
    /// enqueued on `tx` when this returns.
    pub async fn attach_agent(&self, tx: mpsc::UnboundedSender<AgentOutbound>) -> u64 {
        let (cleanup, connection_id) = {
            let mut state = self.state.lock();

            if let Some(old) = state.agent.take() {
                debug!(tunnel = %self.tunnel_id, "replacing active agent socket");
                let last_msg_seq = state.next_msg_seq.saturating_sub(1);
                let go_away = Envelope::new(
                    state.connection_id,
                    0,
                    state.next_msg_seq,
                    FrameBody::Control(ControlFrame::GoAway {
                        last_msg_seq,
                        reason: "Replaced by new connection".into(),
                    }),
                );
                let _ = old.send(AgentOutbound::Frame(wire::encode(&go_away)));
                let _ = old.send(AgentOutbound::Close {
                    code: 1000,
                    reason: "Replaced by new connection".into(),
                });
            }

            let cleanup = drain_streams(
                &mut state.table,
                AbortReason::ConnectionLost,
                "CLI reconnected",
                1001,
            );
            state.table.reset_ids();
            state.connection_id = next_connection_id(state.connection_id);
            state.next_msg_seq = 0;
            state.draining = false;
            state.agent = Some(tx.clone());
            (cleanup, state.connection_id)
        };

        fail_streams(cleanup);

        let handshake = TunnelReady::new(connection_id, &self.tunnel_url);
        let json = serde_json::to_string(&handshake).expect("handshake is serializable");
        let _ = tx.send(AgentOutbound::Text(json));

        self.mark_status(TunnelStatus::Online).await;
        connection_id
    }

    /// Handles the agent socket closing (EOF, reset, or our own close).
    ///
    /// `connection_id` is the id handed out by the matching attach; a close
    /// event from an already-displaced socket is ignored.
    pub async fn agent_closed(&self, connection_id: u64) {
        let cleanup = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id || state.agent.is_none() {
                return;
            }
            state.agent = None;
            drain_streams(
                &mut state.table,
                AbortReason::ConnectionLost,
                "CLI disconnected",
                1001,
            )
        };

        fail_streams(cleanup);
        self.mark_status(TunnelStatus::Offline).await;
    }

    /// Tears the agent connection down after a protocol violation: the
    /// socket is closed and every stream fails before the session idles.
    pub(crate) async fn fail_agent(&self, reason: &str) {
        let cleanup = {
            let mut state = self.state.lock();
            let Some(agent) = state.agent.take() else {
                return;
            };
            let _ = agent.send(AgentOutbound::Close {
                code: 1002,
                reason: reason.to_string(),
            });
            drain_streams(
                &mut state.table,
                AbortReason::ProtocolError,
                "protocol error",
                1011,
            )
        };

        fail_streams(cleanup);
        self.mark_status(TunnelStatus::Offline).await;
    }

    // -----------------------------------------------------------------------
    // Frame ingress
    // -----------------------------------------------------------------------

    /// Processes one binary message from the agent socket.
    ///
    /// A malformed frame or an in-stream ordering violation is fatal: the
    /// session fails everything and returns an error so the read pump exits.
    pub async fn agent_frame(&self, data: &[u8]) -> Result<(), SessionError> {
        let envelope = match wire::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = format!("malformed frame: {e}");
                self.fail_agent(&reason).await;
                return Err(SessionError::Protocol(reason));
            }
        };

        {
            let state = self.state.lock();
            if state.agent.is_none() {
                return Ok(());
            }
            if envelope.connection_id != state.connection_id {
                debug!(
                    frame = envelope.connection_id,
                    current = state.connection_id,
                    "dropping frame from stale connection"
                );
                return Ok(());
            }
        }

        // Each handler re-checks the connection id under its own lock: a
        // reattach can rotate the id between the check above and the
        // handler, and stream ids restart at 1 on the new connection.
        let connection_id = envelope.connection_id;
        match envelope.body {
            FrameBody::Http(frame) => {
                self.handle_http_frame(connection_id, envelope.stream_id, frame)
                    .await
            }
            FrameBody::Ws(frame) => {
                self.handle_agent_ws(connection_id, envelope.stream_id, frame);
                Ok(())
            }
            FrameBody::Control(frame) => {
                self.handle_control(connection_id, frame);
                Ok(())
            }
        }
    }

    async fn mark_status(&self, status: TunnelStatus) {
        if let Err(e) = self
            .registry
            .mark_status(&self.tunnel_id, status, SystemTime::now())
            .await
        {
            warn!(tunnel = %self.tunnel_id, "failed to update tunnel status: {e}");
        }
    }
}

/// Connection ids come from a monotonic millisecond clock; bumped past the
/// previous value if two attaches land in the same millisecond.
fn next_connection_id(prev: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    now.max(prev + 1)
}

/// Deferred teardown work for one failed stream, executed off-lock.
pub(crate) enum StreamCleanup {
    Http(HttpStreamEntry, AbortReason, String, u16),
    Ws(WsStreamEntry, u16),
}

/// Empties both stream maps, returning the teardown work to run once the
/// session lock is released.
pub(crate) fn drain_streams(
    table: &mut StreamTable,
    reason: AbortReason,
    detail: &str,
    ws_close_code: u16,
) -> Vec<StreamCleanup> {
    let mut cleanup = Vec::with_capacity(table.len());
    for (_, entry) in table.http.drain() {
        cleanup.push(StreamCleanup::Http(
            entry,
            reason,
            detail.to_string(),
            ws_close_code,
        ));
    }
    for (_, entry) in table.ws.drain() {
        cleanup.push(StreamCleanup::Ws(entry, ws_close_code));
    }
    cleanup
}

/// Runs stream teardown: cancels deadlines, resolves public-side waiters,
/// aborts body pipes, closes public WebSockets.
pub(crate) fn fail_streams(cleanup: Vec<StreamCleanup>) {
    for item in cleanup {
        match item {
            StreamCleanup::Http(mut entry, reason, detail, ws_close_code) => {
                entry.deadline.cancel();
                let abort = StreamAbort {
                    reason,
                    detail: detail.clone(),
                };
                if let Some(decision) = entry.pending_upgrade.take() {
                    let _ = decision.send(UpgradeDecision::Rejected {
                        close_code: ws_close_code,
                        reason: detail,
                    });
                } else if let Some(respond) = entry.respond.take() {
                    let _ = respond.send(Err(ServeError::Aborted(abort)));
                } else if let Some(body_tx) = entry.body_tx.take() {
                    // The pipe may be full; deliver the abort without
                    // blocking the caller.
                    tokio::spawn(async move {
                        let _ = body_tx.send(Err(abort)).await;
                    });
                }
            }
            StreamCleanup::Ws(entry, close_code) => {
                let _ = entry.to_public.send(PublicWsEvent::Close(Some(close_code)));
            }
        }
    }
}
