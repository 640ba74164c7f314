//! Local origin I/O: HTTP forwarding and WebSocket dialing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use dotunnel_protocol::{FrameBody, Header, HttpFrame, WsFrame, WsOpcode};

use crate::tunnel::{respond, TunnelCtx};

const ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A buffered response from the local origin.
pub(crate) struct OriginResponse {
    pub status: u16,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

/// Client for the local origin. Decompression is disabled so raw bytes
/// round-trip with their `Content-Encoding` intact; the edge in front of
/// the relay handles client-facing compression.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(ORIGIN_TIMEOUT)
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .no_zstd()
        .build()
        .context("failed to build origin HTTP client")
}

/// Hop-by-hop (and encoding-negotiation) headers that must not be replayed
/// to the origin.
fn skip_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("accept-encoding")
}

/// Forwards one assembled request to the local origin.
pub(crate) async fn forward_http(
    client: &reqwest::Client,
    local_addr: SocketAddr,
    request: crate::tunnel::PendingRequest,
) -> Result<OriginResponse> {
    let url = format!("http://{local_addr}{}", request.uri);
    let method: reqwest::Method = request.method.parse().context("invalid HTTP method")?;

    let mut origin_request = client.request(method, &url);
    for (name, value) in &request.headers {
        if skip_request_header(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) else {
            continue;
        };
        origin_request = origin_request.header(name, value);
    }
    origin_request = origin_request.header("Accept-Encoding", "identity");

    if !request.body.is_empty() {
        origin_request = origin_request.body(request.body);
    }

    let response = origin_request
        .send()
        .await
        .context("failed to forward request to local server")?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
        .collect();
    let body = response.bytes().await.context("failed to read origin body")?;

    Ok(OriginResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

/// Headers worth forwarding on a local WebSocket dial.
fn forward_ws_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("sec-websocket-protocol")
        || name.eq_ignore_ascii_case("sec-websocket-extensions")
        || name.eq_ignore_ascii_case("origin")
}

/// Dials the local WebSocket server for an upgrade stream and wires both
/// relay directions; answers 101 on success, 502 on failure.
///
/// The stream is already registered with `local_rx` as its inbound queue,
/// so frames that raced ahead of the dial are delivered in order once the
/// local socket is up. Failure paths unregister it again.
pub(crate) async fn open_local_ws(
    ctx: Arc<TunnelCtx>,
    stream_id: u32,
    uri: String,
    headers: Vec<Header>,
    mut local_rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    let local_url = format!("ws://{}{uri}", ctx.local_addr);
    let mut request = match local_url.clone().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!(stream_id, %local_url, "bad local websocket url: {e}");
            ctx.streams.lock().await.remove(&stream_id);
            respond(&ctx, stream_id, 502, Vec::new(), format!("Bad Gateway: {e}").into_bytes())
                .await;
            return;
        }
    };
    for (name, value) in &headers {
        if !forward_ws_header(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) else {
            continue;
        };
        request.headers_mut().insert(name, value);
    }

    let (local_ws, response) = match tokio_tungstenite::connect_async(request).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(stream_id, "failed to connect local websocket: {e}");
            ctx.streams.lock().await.remove(&stream_id);
            respond(
                &ctx,
                stream_id,
                502,
                Vec::new(),
                format!("Failed to connect to local WebSocket server: {e}").into_bytes(),
            )
            .await;
            return;
        }
    };
    info!(stream_id, status = %response.status(), "local websocket connected");

    let response_headers: Vec<Header> = response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
        .collect();
    ctx.send_frame(
        stream_id,
        FrameBody::Http(HttpFrame::ResponseInit {
            status: 101,
            has_body: false,
            content_length: 0,
            headers: response_headers,
        }),
    )
    .await;

    let (mut local_write, mut local_read) = local_ws.split();

    // Local -> relay.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(message) = local_read.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(stream_id, "local websocket read error: {e}");
                        break;
                    }
                };
                let frame = match message {
                    WsMessage::Text(text) => {
                        WsFrame::message(WsOpcode::Text, text.as_bytes().to_vec())
                    }
                    WsMessage::Binary(data) => WsFrame::message(WsOpcode::Binary, data.to_vec()),
                    WsMessage::Ping(data) => WsFrame::message(WsOpcode::Ping, data.to_vec()),
                    WsMessage::Pong(data) => WsFrame::message(WsOpcode::Pong, data.to_vec()),
                    WsMessage::Close(frame) => {
                        WsFrame::close(frame.map(|f| f.code.into()).unwrap_or(1000))
                    }
                    WsMessage::Frame(_) => continue,
                };
                if !ctx.send_frame(stream_id, FrameBody::Ws(frame)).await {
                    break;
                }
            }
            ctx.streams.lock().await.remove(&stream_id);
            debug!(stream_id, "local websocket closed");
        });
    }

    // Relay -> local: drains the queue that buffered while dialing.
    while let Some(message) = local_rx.recv().await {
        if local_write.send(message).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_skipped() {
        for name in [
            "Host",
            "connection",
            "Upgrade",
            "Transfer-Encoding",
            "accept-encoding",
        ] {
            assert!(skip_request_header(name), "{name} should be skipped");
        }
        assert!(!skip_request_header("content-type"));
        assert!(!skip_request_header("authorization"));
    }

    #[test]
    fn only_negotiation_headers_forward_to_local_ws() {
        assert!(forward_ws_header("Sec-WebSocket-Protocol"));
        assert!(forward_ws_header("sec-websocket-extensions"));
        assert!(forward_ws_header("Origin"));
        assert!(!forward_ws_header("authorization"));
        assert!(!forward_ws_header("cookie"));
    }
}
