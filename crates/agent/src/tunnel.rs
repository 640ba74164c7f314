//! Tunnel runtime: the control-socket event loop and stream bookkeeping.
//!
//! One read loop owns the socket and handles frames in arrival order, so
//! per-stream sequences (init, chunks, end; ws frames behind a promotion)
//! are assembled exactly as sent. Only origin I/O leaves the loop: the
//! HTTP round-trip and the local WebSocket dial run in spawned tasks, with
//! upgrade streams registered on a per-stream channel before the dial so
//! early frames queue instead of dropping. The write pump serialises
//! everything going back, and a ping pump keeps the connection alive
//! (ping scheduling is the agent's job, the relay only answers).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use dotunnel_protocol::{
    wire, ControlFrame, Envelope, FrameBody, Header, HttpFrame, TunnelReady, WsFrame, WsOpcode,
};

use crate::origin;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WRITE_QUEUE: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// An HTTP request being assembled from relay frames.
pub(crate) struct PendingRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

/// Per-stream state on the agent side.
pub(crate) enum StreamState {
    /// HTTP exchange; the request is taken out once forwarded.
    Http(Option<PendingRequest>),
    /// Proxied WebSocket to the local origin.
    WebSocket {
        to_local: mpsc::UnboundedSender<WsMessage>,
    },
}

/// Shared state for frame handlers.
pub(crate) struct TunnelCtx {
    out: mpsc::Sender<WsMessage>,
    pub streams: Mutex<HashMap<u32, StreamState>>,
    connection_id: AtomicU64,
    msg_seq: AtomicU32,
    pub local_addr: SocketAddr,
    pub http: reqwest::Client,
}

impl TunnelCtx {
    /// Encodes and queues one frame with a fresh `msgSeq`.
    pub async fn send_frame(&self, stream_id: u32, body: FrameBody) -> bool {
        let envelope = Envelope::new(
            self.connection_id.load(Ordering::Acquire),
            stream_id,
            self.msg_seq.fetch_add(1, Ordering::Relaxed),
            body,
        );
        self.out
            .send(WsMessage::Binary(wire::encode(&envelope).into()))
            .await
            .is_ok()
    }
}

/// Runs the tunnel until the relay closes the socket or Ctrl+C.
pub(crate) async fn run(ws: WsStream, local_addr: SocketAddr) -> Result<()> {
    let (write, mut read) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(WRITE_QUEUE);
    let cancel = CancellationToken::new();

    let write_handle = tokio::spawn(write_pump(write, out_rx, cancel.clone()));
    let ping_handle = tokio::spawn(ping_pump(out_tx.clone(), cancel.clone()));

    let ctx = Arc::new(TunnelCtx {
        out: out_tx,
        streams: Mutex::new(HashMap::new()),
        connection_id: AtomicU64::new(0),
        msg_seq: AtomicU32::new(0),
        local_addr,
        http: origin::http_client()?,
    });

    let result = loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => handle_handshake(&ctx, &text),
                Some(Ok(WsMessage::Binary(data))) => {
                    match wire::decode(&data) {
                        // Handled inline: frames for one stream must be
                        // applied in the order they arrived.
                        Ok(envelope) => handle_envelope(&ctx, envelope).await,
                        Err(e) => warn!("dropping undecodable frame from relay: {e}"),
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = ctx.out.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => trace!("socket pong"),
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("relay closed connection: {frame:?}");
                    break Ok(());
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => break Err(anyhow!("control socket error: {e}")),
                None => break Err(anyhow!("control socket ended unexpectedly")),
            },

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down tunnel");
                let _ = ctx.out.send(WsMessage::Close(None)).await;
                break Ok(());
            }
        }
    };

    cancel.cancel();
    write_handle.abort();
    ping_handle.abort();
    result
}

/// The one-shot text message binding this side to the session's connection.
fn handle_handshake(ctx: &TunnelCtx, text: &str) {
    match serde_json::from_str::<TunnelReady>(text) {
        Ok(ready) => match ready.connection_id() {
            Some(connection_id) => {
                info!(connection_id, tunnel_url = %ready.tunnel_url, "tunnel ready");
                ctx.connection_id.store(connection_id, Ordering::Release);
            }
            None => warn!("handshake with unexpected type {:?}", ready.msg_type),
        },
        Err(e) => warn!("ignoring unparseable text message: {e}"),
    }
}

async fn handle_envelope(ctx: &Arc<TunnelCtx>, envelope: Envelope) {
    // Frames also carry the connection id; adopt it in case the handshake
    // was lost to a race.
    ctx.connection_id
        .store(envelope.connection_id, Ordering::Release);

    match envelope.body {
        FrameBody::Http(frame) => handle_http(ctx, envelope.stream_id, frame).await,
        FrameBody::Ws(frame) => handle_ws(ctx, envelope.stream_id, frame).await,
        FrameBody::Control(frame) => handle_control(ctx, frame).await,
    }
}

// ---------------------------------------------------------------------------
// HTTP frames
// ---------------------------------------------------------------------------

async fn handle_http(ctx: &Arc<TunnelCtx>, stream_id: u32, frame: HttpFrame) {
    match frame {
        HttpFrame::RequestInit {
            method,
            uri,
            headers,
            has_body,
            ..
        } => {
            debug!(stream_id, %method, %uri, has_body, "request init");
            if is_upgrade_request(&headers) {
                // Register before the dial: ws frames arriving right behind
                // the init queue on the channel instead of dropping.
                let (to_local, local_rx) = mpsc::unbounded_channel();
                ctx.streams
                    .lock()
                    .await
                    .insert(stream_id, StreamState::WebSocket { to_local });
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    origin::open_local_ws(ctx, stream_id, uri, headers, local_rx).await;
                });
            } else {
                ctx.streams.lock().await.insert(
                    stream_id,
                    StreamState::Http(Some(PendingRequest {
                        method,
                        uri,
                        headers,
                        body: Vec::new(),
                    })),
                );
            }
        }
        HttpFrame::RequestBodyChunk { data, .. } => {
            let mut streams = ctx.streams.lock().await;
            if let Some(StreamState::Http(Some(pending))) = streams.get_mut(&stream_id) {
                pending.body.extend_from_slice(&data);
            }
        }
        HttpFrame::RequestEnd => {
            debug!(stream_id, "request end");
            let pending = {
                let mut streams = ctx.streams.lock().await;
                match streams.get_mut(&stream_id) {
                    Some(StreamState::Http(pending)) => pending.take(),
                    _ => None,
                }
            };
            let Some(request) = pending else {
                return;
            };
            // The origin round-trip must not hold up the read loop.
            let ctx = ctx.clone();
            tokio::spawn(async move {
                forward_request(&ctx, stream_id, request).await;
            });
        }
        HttpFrame::RequestAbort { reason, detail } => {
            warn!(stream_id, ?reason, %detail, "request aborted by relay");
            ctx.streams.lock().await.remove(&stream_id);
        }
        HttpFrame::RequestTrailers { .. } => {
            debug!(stream_id, "ignoring request trailers (reserved)");
        }
        other => {
            warn!(stream_id, "unexpected response-direction frame from relay: {other:?}");
        }
    }
}

/// Forwards a completed request to the local origin and streams the answer
/// back. Runs off the read loop.
async fn forward_request(ctx: &Arc<TunnelCtx>, stream_id: u32, request: PendingRequest) {
    let method = request.method.clone();
    let uri = request.uri.clone();

    match origin::forward_http(&ctx.http, ctx.local_addr, request).await {
        Ok(response) => {
            let status = response.status;
            respond(ctx, stream_id, status, response.headers, response.body).await;
            info!(stream_id, %method, %uri, status, "served");
        }
        Err(e) => {
            let detail = format!("Bad Gateway: {e:#}");
            respond(ctx, stream_id, 502, Vec::new(), detail.into_bytes()).await;
            warn!(stream_id, %method, %uri, "origin error: {e:#}");
        }
    }

    ctx.streams.lock().await.remove(&stream_id);
}

/// Emits a full `responseInit → chunk? → responseEnd` sequence.
pub(crate) async fn respond(
    ctx: &TunnelCtx,
    stream_id: u32,
    status: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
) {
    let has_body = !body.is_empty();
    ctx.send_frame(
        stream_id,
        FrameBody::Http(HttpFrame::ResponseInit {
            status,
            has_body,
            content_length: body.len() as u64,
            headers,
        }),
    )
    .await;
    if has_body {
        ctx.send_frame(
            stream_id,
            FrameBody::Http(HttpFrame::ResponseBodyChunk {
                seq: 0,
                is_last: true,
                data: body,
            }),
        )
        .await;
    }
    ctx.send_frame(stream_id, FrameBody::Http(HttpFrame::ResponseEnd))
        .await;
}

pub(crate) fn is_upgrade_request(headers: &[Header]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("upgrade") && value.eq_ignore_ascii_case(b"websocket")
    })
}

// ---------------------------------------------------------------------------
// WebSocket frames
// ---------------------------------------------------------------------------

/// Relay → local: unwraps a tunnel ws frame into a local socket message.
async fn handle_ws(ctx: &Arc<TunnelCtx>, stream_id: u32, frame: WsFrame) {
    let streams = ctx.streams.lock().await;
    let Some(StreamState::WebSocket { to_local }) = streams.get(&stream_id) else {
        debug!(stream_id, "ws frame for unknown stream");
        return;
    };

    let message = match frame.opcode {
        WsOpcode::Text => match String::from_utf8(frame.payload) {
            Ok(text) => WsMessage::Text(text.into()),
            Err(_) => {
                debug!(stream_id, "invalid UTF-8 in text frame");
                return;
            }
        },
        WsOpcode::Binary => WsMessage::Binary(frame.payload.into()),
        WsOpcode::Ping => WsMessage::Ping(frame.payload.into()),
        WsOpcode::Pong => WsMessage::Pong(frame.payload.into()),
        WsOpcode::Close => WsMessage::Close(frame.close_code.map(|code| {
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: code.into(),
                reason: "".into(),
            }
        })),
        WsOpcode::Continuation => {
            debug!(stream_id, "dropping continuation frame");
            return;
        }
    };

    if to_local.send(message).is_err() {
        debug!(stream_id, "local websocket writer is gone");
    }
}

// ---------------------------------------------------------------------------
// Control frames
// ---------------------------------------------------------------------------

async fn handle_control(ctx: &Arc<TunnelCtx>, frame: ControlFrame) {
    match frame {
        ControlFrame::Ping { data } => {
            debug!("control ping");
            ctx.send_frame(0, FrameBody::Control(ControlFrame::Pong { data }))
                .await;
        }
        ControlFrame::Pong { .. } => trace!("control pong"),
        ControlFrame::Error { code, message } => {
            warn!(code, %message, "control error from relay");
        }
        ControlFrame::GoAway { reason, .. } => {
            warn!(%reason, "relay announced goAway");
        }
        ControlFrame::FlowWindowUpdate { .. } => {
            debug!("ignoring flow window update (reserved)");
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

async fn write_pump(
    mut write: futures_util::stream::SplitSink<WsStream, WsMessage>,
    mut out_rx: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = out_rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        warn!("control socket write error: {e}");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = write.send(WsMessage::Close(None)).await;
}

async fn ping_pump(out: mpsc::Sender<WsMessage>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if out.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        assert!(is_upgrade_request(&[("Upgrade".into(), b"WebSocket".to_vec())]));
        assert!(is_upgrade_request(&[
            ("accept".into(), b"*/*".to_vec()),
            ("upgrade".into(), b"websocket".to_vec()),
        ]));
        assert!(!is_upgrade_request(&[("upgrade".into(), b"h2c".to_vec())]));
        assert!(!is_upgrade_request(&[]));
    }

    /// A real control-socket pair: the agent end (as `run` expects it) plus
    /// the relay end the test drives.
    async fn ws_pair() -> (WsStream, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}").as_str())
            .await
            .unwrap();
        (client, accept.await.unwrap())
    }

    fn frame(connection_id: u64, stream_id: u32, next_seq: &mut u32, body: FrameBody) -> WsMessage {
        let envelope = Envelope::new(connection_id, stream_id, *next_seq, body);
        *next_seq += 1;
        WsMessage::Binary(wire::encode(&envelope).into())
    }

    async fn next_frame(relay: &mut WebSocketStream<TcpStream>) -> Envelope {
        loop {
            match relay.next().await.expect("socket open").expect("read ok") {
                WsMessage::Binary(data) => return wire::decode(&data).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected message from agent: {other:?}"),
            }
        }
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    /// Minimal HTTP/1.1 origin: captures one request (head + body) and
    /// answers `200 thanks!`.
    async fn spawn_http_origin() -> (SocketAddr, oneshot::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            let head_end = loop {
                let n = stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "origin connection closed before headers");
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            while buf.len() < head_end + content_length {
                let n = stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "origin connection closed mid-body");
                buf.extend_from_slice(&tmp[..n]);
            }
            let body = buf[head_end..head_end + content_length].to_vec();
            let _ = tx.send((head, body));
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      content-type: text/plain\r\n\
                      content-length: 7\r\n\
                      connection: close\r\n\r\n\
                      thanks!",
                )
                .await
                .unwrap();
        });
        (addr, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn request_frames_assemble_in_order() {
        let (agent_ws, mut relay) = ws_pair().await;
        let (origin_addr, origin_rx) = spawn_http_origin().await;
        let agent = tokio::spawn(run(agent_ws, origin_addr));

        // Init, three chunks, end, written back-to-back: the assembly path
        // must apply them in arrival order even on a multi-thread runtime.
        let mut seq = 0u32;
        relay
            .send(frame(
                7,
                1,
                &mut seq,
                FrameBody::Http(HttpFrame::RequestInit {
                    method: "POST".into(),
                    uri: "/up".into(),
                    version: 1,
                    headers: vec![("content-type".into(), b"text/plain".to_vec())],
                    has_body: true,
                }),
            ))
            .await
            .unwrap();
        for (i, part) in [&b"ab"[..], b"cd", b"ef"].into_iter().enumerate() {
            relay
                .send(frame(
                    7,
                    1,
                    &mut seq,
                    FrameBody::Http(HttpFrame::RequestBodyChunk {
                        seq: i as u32,
                        is_last: i == 2,
                        data: part.to_vec(),
                    }),
                ))
                .await
                .unwrap();
        }
        relay
            .send(frame(7, 1, &mut seq, FrameBody::Http(HttpFrame::RequestEnd)))
            .await
            .unwrap();

        let (head, body) = origin_rx.await.unwrap();
        assert!(head.starts_with("POST /up HTTP/1.1"), "request line: {head}");
        assert!(head.to_lowercase().contains("content-type: text/plain"));
        assert_eq!(body, b"abcdef", "body must reach the origin assembled in order");

        let init = next_frame(&mut relay).await;
        assert_eq!(init.stream_id, 1);
        match init.body {
            FrameBody::Http(HttpFrame::ResponseInit { status, has_body, .. }) => {
                assert_eq!(status, 200);
                assert!(has_body);
            }
            other => panic!("expected responseInit, got {other:?}"),
        }
        match next_frame(&mut relay).await.body {
            FrameBody::Http(HttpFrame::ResponseBodyChunk { seq, data, .. }) => {
                assert_eq!(seq, 0);
                assert_eq!(data, b"thanks!");
            }
            other => panic!("expected body chunk, got {other:?}"),
        }
        assert!(matches!(
            next_frame(&mut relay).await.body,
            FrameBody::Http(HttpFrame::ResponseEnd)
        ));

        relay.close(None).await.unwrap();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ws_promotion_relays_frames_queued_behind_init() {
        let (agent_ws, mut relay) = ws_pair().await;

        // Local ws origin echoing data frames back.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        ws.send(message).await.unwrap();
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        let agent = tokio::spawn(run(agent_ws, origin_addr));

        let mut seq = 0u32;
        relay
            .send(frame(
                7,
                1,
                &mut seq,
                FrameBody::Http(HttpFrame::RequestInit {
                    method: "GET".into(),
                    uri: "/chat".into(),
                    version: 1,
                    headers: vec![("upgrade".into(), b"websocket".to_vec())],
                    has_body: false,
                }),
            ))
            .await
            .unwrap();
        // Written right behind the init, before the local dial can have
        // finished: the stream queue must hold it, not drop it.
        relay
            .send(frame(
                7,
                1,
                &mut seq,
                FrameBody::Ws(WsFrame::message(WsOpcode::Text, b"hello".to_vec())),
            ))
            .await
            .unwrap();

        let init = next_frame(&mut relay).await;
        match init.body {
            FrameBody::Http(HttpFrame::ResponseInit { status, .. }) => assert_eq!(status, 101),
            other => panic!("expected 101 responseInit, got {other:?}"),
        }

        let echoed = next_frame(&mut relay).await;
        assert_eq!(echoed.stream_id, 1);
        match echoed.body {
            FrameBody::Ws(ws_frame) => {
                assert_eq!(ws_frame.opcode, WsOpcode::Text);
                assert_eq!(ws_frame.payload, b"hello");
            }
            other => panic!("expected echoed ws frame, got {other:?}"),
        }

        relay.close(None).await.unwrap();
        agent.await.unwrap().unwrap();
    }
}
