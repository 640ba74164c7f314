//! Public-facing ingress: host-routed HTTP and WebSocket traffic.
//!
//! Every request whose `Host` matches the tunnel pattern is routed by
//! subdomain to its session. Requests with an upgrade header enter the
//! deferred-upgrade path (the client sees 101 immediately, frames flow once
//! the agent confirms); everything else is proxied as a streamed exchange.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{stream, SinkExt, StreamExt, TryStreamExt};
use tracing::{debug, error, warn};

use dotunnel_protocol::{Header, WsOpcode};
use dotunnel_session::{
    PublicRequest, PublicResponse, PublicWsEvent, ServeError, TunnelRegistry, TunnelSession,
    UpgradeDecision, UpgradeTicket,
};

use crate::AppState;

pub(crate) async fn public_entry(State(state): State<AppState>, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let Some(subdomain) = state.config.host_pattern.subdomain_of(host) else {
        return plain(StatusCode::NOT_FOUND, "Unknown host");
    };

    let record = match state.registry.find_by_subdomain(&subdomain).await {
        Ok(Some(record)) => record,
        Ok(None) => return plain(StatusCode::NOT_FOUND, "Unknown tunnel"),
        Err(e) => {
            error!(%subdomain, "registry lookup failed: {e}");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Registry unavailable");
        }
    };

    // A session exists only once an agent has attached at least once.
    let Some(session) = state.sessions.get(&record.public_id) else {
        return plain(StatusCode::BAD_GATEWAY, "Tunnel offline");
    };

    if is_websocket_upgrade(req.headers()) {
        serve_ws(session, req).await
    } else {
        serve_http(session, req).await
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn collect_headers(headers: &HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP proxying
// ---------------------------------------------------------------------------

async fn serve_http(session: Arc<TunnelSession>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = collect_headers(&parts.headers);

    let body = request_has_body(&parts.headers)
        .then(|| body.into_data_stream().map_err(io::Error::other).boxed());

    let request = PublicRequest {
        method: parts.method.as_str().to_string(),
        uri,
        headers,
        body,
    };

    match session.serve_http(request).await {
        Ok(response) => build_response(response),
        Err(e) => serve_error(e),
    }
}

/// Whether the client is sending a request body worth streaming.
fn request_has_body(headers: &HeaderMap) -> bool {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    match content_length {
        Some(length) => length > 0,
        None => headers.contains_key(header::TRANSFER_ENCODING),
    }
}

fn build_response(response: PublicResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in response.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_bytes(&value) else {
            continue;
        };
        // Hop-by-hop headers do not survive the proxy hop.
        if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let body = match response.body {
        Some(rx) => Body::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|item| (item.map_err(io::Error::other), rx))
        })),
        None => Body::empty(),
    };

    builder
        .body(body)
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "Bad upstream response"))
}

fn serve_error(error: ServeError) -> Response {
    match error {
        ServeError::Offline => plain(StatusCode::BAD_GATEWAY, "Tunnel offline"),
        ServeError::Overloaded => {
            plain(StatusCode::SERVICE_UNAVAILABLE, "Too many concurrent requests")
        }
        ServeError::Timeout => plain(StatusCode::GATEWAY_TIMEOUT, "Request timeout"),
        ServeError::Aborted(abort) => {
            (StatusCode::BAD_GATEWAY, format!("Tunnel error: {abort}")).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket proxying
// ---------------------------------------------------------------------------

async fn serve_ws(session: Arc<TunnelSession>, req: Request<Body>) -> Response {
    let (mut parts, _body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = collect_headers(&parts.headers);

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    // Register before upgrading so the agent already has `requestInit` by
    // the time the public socket pairs.
    let ticket = match session.serve_upgrade(method, uri, headers) {
        Ok(ticket) => ticket,
        Err(e) => return serve_error(e),
    };

    ws.on_upgrade(move |socket| run_public_ws(session, ticket, socket))
}

/// Owns one public WebSocket from pairing to close.
async fn run_public_ws(session: Arc<TunnelSession>, ticket: UpgradeTicket, mut socket: WebSocket) {
    let stream_id = ticket.stream_id;

    let mut pipe = match ticket.decision().await {
        UpgradeDecision::Accepted(pipe) => pipe,
        UpgradeDecision::Rejected { close_code, reason } => {
            debug!(stream_id, close_code, %reason, "upgrade rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = pipe.events.recv() => match event {
                Some(PublicWsEvent::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(PublicWsEvent::Binary(data)) => {
                    if sink.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(PublicWsEvent::Ping(data)) => {
                    if sink.send(Message::Ping(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(PublicWsEvent::Close(code)) => {
                    // Closed from the agent side; the stream is already gone.
                    let frame = code.map(|code| CloseFrame {
                        code,
                        reason: Default::default(),
                    });
                    let _ = sink.send(Message::Close(frame)).await;
                    return;
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    session.public_ws_message(stream_id, WsOpcode::Text, text.as_bytes().to_vec());
                }
                Some(Ok(Message::Binary(data))) => {
                    session.public_ws_message(stream_id, WsOpcode::Binary, data.to_vec());
                }
                Some(Ok(Message::Close(frame))) => {
                    session.public_ws_closed(stream_id, frame.map(|f| f.code));
                    return;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    warn!(stream_id, "public socket error: {e}");
                    session.public_ws_closed(stream_id, None);
                    return;
                }
                None => {
                    session.public_ws_closed(stream_id, None);
                    return;
                }
            },
        }
    }

    // Writing to the public client failed mid-relay.
    session.public_ws_closed(stream_id, None);
}
