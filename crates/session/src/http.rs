//! The HTTP stream machine: one proxied exchange per stream.
//!
//! The public side sees two primitives per stream: a single-shot "headers
//! available" signal (resolved with the [`PublicResponse`]) and a bounded
//! body pipe. The agent side sees `requestInit → chunk* → requestEnd |
//! requestAbort` and answers with the mirrored response sequence.
//!
//! Terminal response frames free the stream slot, so anything addressed to
//! a freed stream (a `responseInit` arriving after the deadline, chunks
//! after an abort) lands on the unknown-stream path and is dropped.
//! Ordering violations on a live stream fail the whole agent connection.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dotunnel_protocol::{AbortReason, FrameBody, Header, HttpFrame, HTTP_VERSION_1};

use crate::session::{SessionError, TunnelSession};
use crate::streams::{HttpStreamEntry, HttpStreamState};
use crate::ws::{self, UpgradeDecision};

/// Response body chunks buffered before the agent read loop blocks.
/// Back-pressure from a slow public client propagates to the control socket
/// through this bound; chunks are never dropped.
const RESPONSE_PIPE_CAPACITY: usize = 32;

/// A public client request handed to the session by the front door.
pub struct PublicRequest {
    pub method: String,
    /// Path plus query string.
    pub uri: String,
    pub headers: Vec<Header>,
    pub body: Option<RequestBody>,
}

/// Streamed request body from the public client. An `Err` item means the
/// client aborted mid-body.
pub type RequestBody = BoxStream<'static, Result<Bytes, io::Error>>;

/// The agent's response, handed back to the front door once headers arrive.
#[derive(Debug)]
pub struct PublicResponse {
    pub status: u16,
    pub headers: Vec<Header>,
    /// Consumer half of the body pipe; `None` when the response has no body.
    pub body: Option<mpsc::Receiver<Result<Bytes, StreamAbort>>>,
}

/// Early termination of one stream direction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{detail}")]
pub struct StreamAbort {
    pub reason: AbortReason,
    pub detail: String,
}

/// Why the session could not (or can no longer) serve a public request.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// No agent attached, or the session is draining after goAway.
    #[error("tunnel offline")]
    Offline,

    /// The concurrent-stream cap is reached.
    #[error("too many concurrent requests")]
    Overloaded,

    /// The deadline fired before the agent answered.
    #[error("request timed out")]
    Timeout,

    /// The stream was aborted before or during the response.
    #[error("stream aborted: {0}")]
    Aborted(StreamAbort),
}

/// Off-lock continuation after processing a `responseInit`.
enum InitOutcome {
    Drop,
    Fatal(String),
    Respond(
        oneshot::Sender<Result<PublicResponse, ServeError>>,
        PublicResponse,
    ),
    Upgrade(ws::UpgradeOutcome),
}

/// Off-lock continuation after processing a `responseBodyChunk`.
enum ChunkOutcome {
    Drop,
    Fatal(String),
    Deliver(Option<mpsc::Sender<Result<Bytes, StreamAbort>>>, Bytes),
}

impl TunnelSession {
    /// Serves one public HTTP request through the tunnel.
    ///
    /// Resolves when the agent delivers response headers, the deadline
    /// fires, or the stream fails. The returned body pipe keeps streaming
    /// after this returns.
    pub async fn serve_http(self: &Arc<Self>, req: PublicRequest) -> Result<PublicResponse, ServeError> {
        let has_body = req.body.is_some();

        let (stream_id, connection_id, deadline, respond_rx) = {
            let mut state = self.state.lock();
            if state.agent.is_none() || state.draining {
                return Err(ServeError::Offline);
            }
            if state.table.len() >= self.config.max_concurrent_streams {
                return Err(ServeError::Overloaded);
            }

            let stream_id = state.table.alloc_stream_id();
            let (respond_tx, respond_rx) = oneshot::channel();
            let deadline = CancellationToken::new();
            state
                .table
                .http
                .insert(stream_id, HttpStreamEntry::request(respond_tx, deadline.clone()));

            state.send_frame(
                stream_id,
                FrameBody::Http(HttpFrame::RequestInit {
                    method: req.method,
                    uri: req.uri,
                    version: HTTP_VERSION_1,
                    headers: req.headers,
                    has_body,
                }),
            );

            if !has_body {
                if let Some(entry) = state.table.http.get_mut(&stream_id) {
                    entry.request_closed = true;
                }
                state.send_frame(stream_id, FrameBody::Http(HttpFrame::RequestEnd));
            }

            (stream_id, state.connection_id, deadline, respond_rx)
        };

        self.spawn_deadline(stream_id, connection_id, deadline);
        if let Some(body) = req.body {
            self.spawn_request_body_pump(stream_id, connection_id, body);
        }

        match respond_rx.await {
            Ok(result) => result,
            // All teardown paths resolve the waiter; a dropped sender means
            // the session itself went away mid-flight.
            Err(_) => Err(ServeError::Aborted(StreamAbort {
                reason: AbortReason::Unknown,
                detail: "session dropped the stream".into(),
            })),
        }
    }

    /// Streams the public request body to the agent as numbered chunks,
    /// then `requestEnd`; a client abort becomes `requestAbort(cancelled)`.
    fn spawn_request_body_pump(
        self: &Arc<Self>,
        stream_id: u32,
        connection_id: u64,
        mut body: RequestBody,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut seq = 0u32;
            loop {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        if !session.emit_request_chunk(stream_id, connection_id, seq, chunk) {
                            // Stream freed (deadline, abort, reattach) or the
                            // agent is gone; stop reading.
                            return;
                        }
                        seq += 1;
                    }
                    Some(Err(e)) => {
                        session.emit_request_abort(
                            stream_id,
                            connection_id,
                            AbortReason::Cancelled,
                            format!("client aborted request body: {e}"),
                        );
                        return;
                    }
                    None => {
                        session.emit_request_end(stream_id, connection_id);
                        return;
                    }
                }
            }
        });
    }

    fn emit_request_chunk(&self, stream_id: u32, connection_id: u64, seq: u32, data: Bytes) -> bool {
        let mut state = self.state.lock();
        if state.connection_id != connection_id {
            return false;
        }
        let open = state
            .table
            .http
            .get(&stream_id)
            .is_some_and(|entry| !entry.request_closed);
        if !open {
            return false;
        }
        state.send_frame(
            stream_id,
            FrameBody::Http(HttpFrame::RequestBodyChunk {
                seq,
                is_last: false,
                data: data.to_vec(),
            }),
        )
    }

    fn emit_request_end(&self, stream_id: u32, connection_id: u64) {
        let mut state = self.state.lock();
        if state.connection_id != connection_id {
            return;
        }
        match state.table.http.get_mut(&stream_id) {
            Some(entry) if !entry.request_closed => entry.request_closed = true,
            _ => return,
        }
        state.send_frame(stream_id, FrameBody::Http(HttpFrame::RequestEnd));
    }

    /// Emits `requestAbort` and frees the slot. `requestEnd` and
    /// `requestAbort` are mutually exclusive: whichever went out first wins.
    fn emit_request_abort(
        &self,
        stream_id: u32,
        connection_id: u64,
        reason: AbortReason,
        detail: String,
    ) {
        let entry = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            let Some(entry) = state.table.http.remove(&stream_id) else {
                return;
            };
            if !entry.request_closed {
                state.send_frame(
                    stream_id,
                    FrameBody::Http(HttpFrame::RequestAbort { reason, detail }),
                );
            }
            entry
        };
        entry.deadline.cancel();
    }

    // -----------------------------------------------------------------------
    // Deadline
    // -----------------------------------------------------------------------

    pub(crate) fn spawn_deadline(
        self: &Arc<Self>,
        stream_id: u32,
        connection_id: u64,
        token: CancellationToken,
    ) {
        let session = self.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    session.on_deadline(stream_id, connection_id);
                }
            }
        });
    }

    /// Fires at most once per stream: frees the slot, aborts the public
    /// side, and tells the agent (unless the request direction already
    /// closed with `requestEnd`).
    fn on_deadline(&self, stream_id: u32, connection_id: u64) {
        let mut entry = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            let Some(entry) = state.table.http.remove(&stream_id) else {
                return;
            };
            if !entry.request_closed {
                state.send_frame(
                    stream_id,
                    FrameBody::Http(HttpFrame::RequestAbort {
                        reason: AbortReason::Timeout,
                        detail: "Request timeout".into(),
                    }),
                );
            }
            entry
        };

        if let Some(decision) = entry.pending_upgrade.take() {
            let _ = decision.send(UpgradeDecision::Rejected {
                close_code: 1011,
                reason: "WebSocket upgrade timeout".into(),
            });
        } else if let Some(respond) = entry.respond.take() {
            let _ = respond.send(Err(ServeError::Timeout));
        } else if let Some(body_tx) = entry.body_tx.take() {
            let abort = StreamAbort {
                reason: AbortReason::Timeout,
                detail: "Request timeout".into(),
            };
            tokio::spawn(async move {
                let _ = body_tx.send(Err(abort)).await;
            });
        }
    }

    // -----------------------------------------------------------------------
    // Response ingress from the agent
    // -----------------------------------------------------------------------

    pub(crate) async fn handle_http_frame(
        &self,
        connection_id: u64,
        stream_id: u32,
        frame: HttpFrame,
    ) -> Result<(), SessionError> {
        match frame {
            HttpFrame::ResponseInit {
                status,
                has_body,
                content_length: _,
                headers,
            } => {
                self.on_response_init(connection_id, stream_id, status, has_body, headers)
                    .await
            }
            HttpFrame::ResponseBodyChunk { seq, is_last: _, data } => {
                self.on_response_chunk(connection_id, stream_id, seq, data).await
            }
            HttpFrame::ResponseEnd => self.on_response_end(connection_id, stream_id).await,
            HttpFrame::ResponseAbort { reason, detail } => {
                self.on_response_abort(connection_id, stream_id, reason, detail);
                Ok(())
            }
            HttpFrame::ResponseInterim { status, .. } => {
                debug!(stream_id, status, "ignoring interim response (reserved)");
                Ok(())
            }
            HttpFrame::RequestTrailers { .. } | HttpFrame::ResponseTrailers { .. } => {
                debug!(stream_id, "ignoring trailers (reserved)");
                Ok(())
            }
            HttpFrame::RequestInit { .. }
            | HttpFrame::RequestBodyChunk { .. }
            | HttpFrame::RequestEnd
            | HttpFrame::RequestAbort { .. } => {
                self.protocol_violation(format!(
                    "request-direction HTTP frame from agent on stream {stream_id}"
                ))
                .await
            }
        }
    }

    async fn on_response_init(
        &self,
        connection_id: u64,
        stream_id: u32,
        status: u16,
        has_body: bool,
        headers: Vec<Header>,
    ) -> Result<(), SessionError> {
        let outcome = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return Ok(());
            }
            let is_upgrade = state
                .table
                .http
                .get(&stream_id)
                .map(|entry| entry.pending_upgrade.is_some());
            match is_upgrade {
                None => InitOutcome::Drop,
                Some(true) => {
                    InitOutcome::Upgrade(ws::upgrade_response(&mut state, stream_id, status))
                }
                Some(false) => {
                    // Re-borrowed mutably; the slot is still present because
                    // the lock is held.
                    match state.table.http.get_mut(&stream_id) {
                        None => InitOutcome::Drop,
                        Some(entry) if entry.state == HttpStreamState::ResponseStreaming => {
                            InitOutcome::Fatal(format!(
                                "duplicate responseInit on stream {stream_id}"
                            ))
                        }
                        Some(entry) => {
                            entry.state = HttpStreamState::ResponseStreaming;
                            let body = if has_body {
                                let (tx, rx) = mpsc::channel(RESPONSE_PIPE_CAPACITY);
                                entry.body_tx = Some(tx);
                                Some(rx)
                            } else {
                                None
                            };
                            match entry.respond.take() {
                                Some(respond) => InitOutcome::Respond(
                                    respond,
                                    PublicResponse {
                                        status,
                                        headers,
                                        body,
                                    },
                                ),
                                None => InitOutcome::Drop,
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            InitOutcome::Drop => {
                debug!(stream_id, "dropping responseInit for unknown stream");
                Ok(())
            }
            InitOutcome::Fatal(reason) => self.protocol_violation(reason).await,
            InitOutcome::Respond(respond, response) => {
                let _ = respond.send(Ok(response));
                Ok(())
            }
            InitOutcome::Upgrade(outcome) => {
                self.finish_upgrade(outcome);
                Ok(())
            }
        }
    }

    async fn on_response_chunk(
        &self,
        connection_id: u64,
        stream_id: u32,
        seq: u32,
        data: Vec<u8>,
    ) -> Result<(), SessionError> {
        let outcome = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return Ok(());
            }
            match state.table.http.get_mut(&stream_id) {
                None => ChunkOutcome::Drop,
                Some(entry) => {
                    if entry.state != HttpStreamState::ResponseStreaming {
                        ChunkOutcome::Fatal(format!(
                            "response body chunk before responseInit on stream {stream_id}"
                        ))
                    } else if seq != entry.next_chunk_seq {
                        ChunkOutcome::Fatal(format!(
                            "out-of-order response chunk on stream {stream_id}: got seq {seq}, expected {}",
                            entry.next_chunk_seq
                        ))
                    } else {
                        entry.next_chunk_seq = seq + 1;
                        ChunkOutcome::Deliver(entry.body_tx.clone(), Bytes::from(data))
                    }
                }
            }
        };

        match outcome {
            ChunkOutcome::Drop => {
                debug!(stream_id, "dropping response chunk for unknown stream");
                Ok(())
            }
            ChunkOutcome::Fatal(reason) => self.protocol_violation(reason).await,
            ChunkOutcome::Deliver(Some(tx), data) => {
                // Suspends here under back-pressure from the public client;
                // a closed consumer is swallowed and the stream drains.
                let _ = tx.send(Ok(data)).await;
                Ok(())
            }
            ChunkOutcome::Deliver(None, _) => {
                debug!(stream_id, "discarding body chunk for bodiless response");
                Ok(())
            }
        }
    }

    async fn on_response_end(&self, connection_id: u64, stream_id: u32) -> Result<(), SessionError> {
        let entry = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return Ok(());
            }
            state.table.http.remove(&stream_id)
        };

        let Some(entry) = entry else {
            debug!(stream_id, "dropping responseEnd for unknown stream");
            return Ok(());
        };

        if entry.state == HttpStreamState::AwaitingInit {
            // Put nothing back: the agent broke framing, everything fails.
            return self
                .protocol_violation(format!("responseEnd before responseInit on stream {stream_id}"))
                .await;
        }

        entry.deadline.cancel();
        // Dropping the entry drops `body_tx`, closing the pipe normally.
        Ok(())
    }

    fn on_response_abort(
        &self,
        connection_id: u64,
        stream_id: u32,
        reason: AbortReason,
        detail: String,
    ) {
        let entry = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            state.table.http.remove(&stream_id)
        };

        let Some(mut entry) = entry else {
            debug!(stream_id, "dropping responseAbort for unknown stream");
            return;
        };

        entry.deadline.cancel();
        let abort = StreamAbort {
            reason,
            detail: detail.clone(),
        };

        if let Some(decision) = entry.pending_upgrade.take() {
            let _ = decision.send(UpgradeDecision::Rejected {
                close_code: 1011,
                reason: detail,
            });
        } else if let Some(respond) = entry.respond.take() {
            let _ = respond.send(Err(ServeError::Aborted(abort)));
        } else if let Some(body_tx) = entry.body_tx.take() {
            tokio::spawn(async move {
                let _ = body_tx.send(Err(abort)).await;
            });
        }
    }

    pub(crate) async fn protocol_violation(&self, reason: String) -> Result<(), SessionError> {
        self.fail_agent(&reason).await;
        Err(SessionError::Protocol(reason))
    }
}
