//! The WebSocket stream machine: deferred upgrades and frame relay.
//!
//! A public request carrying `Upgrade: websocket` registers as an HTTP
//! stream with a pending-upgrade marker and emits `requestInit` only. When
//! the agent answers 101 the stream is promoted into the WebSocket map and
//! both directions relay frames until either side closes. A non-101 answer,
//! a `responseAbort`, or the deadline rejects the upgrade and the public
//! socket is closed with the matching close code.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dotunnel_protocol::{FrameBody, Header, HttpFrame, WsFrame, WsOpcode, HTTP_VERSION_1};

use crate::http::ServeError;
use crate::session::{SessionState, TunnelSession};
use crate::streams::{HttpStreamEntry, WsStreamEntry};

/// Frames relayed from the agent toward one public WebSocket client.
///
/// Pings are forwarded so the public peer's stack answers them itself;
/// pongs from the agent are dropped before reaching this pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum PublicWsEvent {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Close(Option<u16>),
}

/// How the agent answered a deferred upgrade.
#[derive(Debug)]
pub enum UpgradeDecision {
    /// Promoted: relay frames through the pipe until close.
    Accepted(WsPipe),
    /// Close the public socket with this code and reason.
    Rejected { close_code: u16, reason: String },
}

/// The public side of a promoted stream.
#[derive(Debug)]
pub struct WsPipe {
    pub stream_id: u32,
    /// Frames from the agent; ends when the stream is removed.
    pub events: mpsc::UnboundedReceiver<PublicWsEvent>,
}

/// Handed to the front door when an upgrade request is registered; resolves
/// once the agent answers or the deadline fires.
#[derive(Debug)]
pub struct UpgradeTicket {
    pub stream_id: u32,
    pub(crate) decision: oneshot::Receiver<UpgradeDecision>,
}

impl UpgradeTicket {
    pub async fn decision(self) -> UpgradeDecision {
        self.decision
            .await
            .unwrap_or(UpgradeDecision::Rejected {
                close_code: 1011,
                reason: "session closed".into(),
            })
    }
}

/// Off-lock continuation of an upgrade's `responseInit`.
pub(crate) enum UpgradeOutcome {
    Promote(oneshot::Sender<UpgradeDecision>, WsPipe),
    Reject(oneshot::Sender<UpgradeDecision>, u16, String),
    Gone,
}

/// Consumes the `responseInit` of a pending upgrade. Called under the
/// session lock from the HTTP response path.
pub(crate) fn upgrade_response(
    state: &mut SessionState,
    stream_id: u32,
    status: u16,
) -> UpgradeOutcome {
    let Some(mut entry) = state.table.http.remove(&stream_id) else {
        return UpgradeOutcome::Gone;
    };
    entry.deadline.cancel();
    let Some(decision) = entry.pending_upgrade.take() else {
        return UpgradeOutcome::Gone;
    };

    if status == 101 {
        let (to_public, events) = mpsc::unbounded_channel();
        state.table.ws.insert(stream_id, WsStreamEntry { to_public });
        UpgradeOutcome::Promote(decision, WsPipe { stream_id, events })
    } else {
        UpgradeOutcome::Reject(
            decision,
            1002,
            format!("upstream rejected upgrade with status {status}"),
        )
    }
}

impl TunnelSession {
    /// Registers a public WebSocket upgrade request.
    ///
    /// The public client already sees `101` (the socket pairs on the front
    /// door side); the returned ticket resolves once the agent accepts or
    /// the upgrade is rejected.
    pub fn serve_upgrade(
        self: &Arc<Self>,
        method: String,
        uri: String,
        headers: Vec<Header>,
    ) -> Result<UpgradeTicket, ServeError> {
        let (stream_id, connection_id, deadline, decision_rx) = {
            let mut state = self.state.lock();
            if state.agent.is_none() || state.draining {
                return Err(ServeError::Offline);
            }
            if state.table.len() >= self.config.max_concurrent_streams {
                return Err(ServeError::Overloaded);
            }

            let stream_id = state.table.alloc_stream_id();
            let (decision_tx, decision_rx) = oneshot::channel();
            let deadline = CancellationToken::new();
            state
                .table
                .http
                .insert(stream_id, HttpStreamEntry::upgrade(decision_tx, deadline.clone()));

            state.send_frame(
                stream_id,
                FrameBody::Http(HttpFrame::RequestInit {
                    method,
                    uri,
                    version: HTTP_VERSION_1,
                    headers,
                    has_body: false,
                }),
            );

            (stream_id, state.connection_id, deadline, decision_rx)
        };

        self.spawn_deadline(stream_id, connection_id, deadline);
        Ok(UpgradeTicket {
            stream_id,
            decision: decision_rx,
        })
    }

    /// Delivers an upgrade decision to the waiting public task. If the
    /// public side vanished before a promotion landed, the fresh stream is
    /// torn down again so the agent sees a close.
    pub(crate) fn finish_upgrade(&self, outcome: UpgradeOutcome) {
        match outcome {
            UpgradeOutcome::Promote(decision, pipe) => {
                let stream_id = pipe.stream_id;
                if decision.send(UpgradeDecision::Accepted(pipe)).is_err() {
                    self.public_ws_closed(stream_id, Some(1001));
                }
            }
            UpgradeOutcome::Reject(decision, close_code, reason) => {
                let _ = decision.send(UpgradeDecision::Rejected { close_code, reason });
            }
            UpgradeOutcome::Gone => {}
        }
    }

    // -----------------------------------------------------------------------
    // Frame relay
    // -----------------------------------------------------------------------

    /// Agent → public: forwards data frames, answers nothing itself.
    pub(crate) fn handle_agent_ws(&self, connection_id: u64, stream_id: u32, frame: WsFrame) {
        let mut state = self.state.lock();
        if state.connection_id != connection_id {
            return;
        }
        let Some(entry) = state.table.ws.get(&stream_id) else {
            debug!(stream_id, "dropping ws frame for unknown stream");
            return;
        };
        let sender = entry.to_public.clone();

        let event = match frame.opcode {
            WsOpcode::Text => match String::from_utf8(frame.payload) {
                Ok(text) => PublicWsEvent::Text(text),
                Err(_) => {
                    warn!(stream_id, "dropping ws text frame with invalid UTF-8");
                    return;
                }
            },
            WsOpcode::Binary => PublicWsEvent::Binary(frame.payload),
            WsOpcode::Ping => PublicWsEvent::Ping(frame.payload),
            WsOpcode::Pong => return,
            WsOpcode::Continuation => {
                debug!(stream_id, "dropping ws continuation frame");
                return;
            }
            WsOpcode::Close => {
                state.table.ws.remove(&stream_id);
                drop(state);
                let _ = sender.send(PublicWsEvent::Close(frame.close_code));
                return;
            }
        };

        drop(state);
        if sender.send(event).is_err() {
            // Public task is gone without a close event; free the slot.
            self.state.lock().table.ws.remove(&stream_id);
        }
    }

    /// Public → agent: wraps one client message as a ws frame.
    pub fn public_ws_message(&self, stream_id: u32, opcode: WsOpcode, payload: Vec<u8>) {
        let mut state = self.state.lock();
        if !state.table.ws.contains_key(&stream_id) {
            return;
        }
        state.send_frame(stream_id, FrameBody::Ws(WsFrame::message(opcode, payload)));
    }

    /// Public → agent: the client socket closed; emits the final close
    /// frame and removes the stream.
    pub fn public_ws_closed(&self, stream_id: u32, close_code: Option<u16>) {
        let mut state = self.state.lock();
        if state.table.ws.remove(&stream_id).is_none() {
            return;
        }
        state.send_frame(
            stream_id,
            FrameBody::Ws(WsFrame::close(close_code.unwrap_or(1000))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticket_resolves_rejected_when_sender_dropped() {
        let (decision_tx, decision_rx) = oneshot::channel();
        let ticket = UpgradeTicket {
            stream_id: 1,
            decision: decision_rx,
        };
        drop(decision_tx);

        match ticket.decision().await {
            UpgradeDecision::Rejected { close_code, .. } => assert_eq!(close_code, 1011),
            UpgradeDecision::Accepted(_) => panic!("expected rejection"),
        }
    }
}
