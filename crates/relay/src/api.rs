//! Agent-facing connect API: tunnel creation and the control socket attach.
//!
//! `POST /_api/tunnel/connect` creates or looks up a tunnel (bearer auth);
//! `GET /_api/tunnel/connect?tunnelId=…` with an upgrade header becomes the
//! agent control socket. The socket runs as two pumps: a read loop feeding
//! [`TunnelSession::agent_frame`] and a write pump draining the session's
//! outbound queue.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dotunnel_protocol::MAX_FRAME_SIZE;
use dotunnel_session::{AgentOutbound, TunnelSession};

use crate::registry::valid_subdomain;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectRequest {
    #[serde(default)]
    subdomain: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectResponse {
    tunnel_id: String,
    tunnel_url: String,
    subdomain: String,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Bearer check against the configured agent token. The real user/token
/// model belongs to the auth collaborator; this guards single-token setups.
fn check_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.config.agent_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(api_error(
            StatusCode::UNAUTHORIZED,
            "invalid or missing bearer token",
        ))
    }
}

/// `POST /_api/tunnel/connect`: returns the tunnel for the requested
/// subdomain, creating an ephemeral one when none is given.
pub(crate) async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> Response {
    if let Err(response) = check_bearer(&state, &headers) {
        return response;
    }

    let requested = request.subdomain;
    if let Some(subdomain) = &requested {
        if !valid_subdomain(subdomain) {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid subdomain {subdomain:?}"),
            );
        }
    }

    let record = state.registry.find_or_create(requested);
    let tunnel_url = state
        .config
        .host_pattern
        .url_for(&state.config.url_scheme, &record.subdomain);
    info!(tunnel = %record.public_id, subdomain = %record.subdomain, "tunnel connect");

    Json(ConnectResponse {
        tunnel_id: record.public_id,
        tunnel_url,
        subdomain: record.subdomain,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct AttachQuery {
    #[serde(rename = "tunnelId")]
    tunnel_id: String,
}

/// `GET /_api/tunnel/connect?tunnelId=…`: upgrades into the agent control
/// socket and attaches it to the tunnel's session.
pub(crate) async fn attach(
    State(state): State<AppState>,
    Query(query): Query<AttachQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(response) = check_bearer(&state, &headers) {
        return response;
    }

    let Some(record) = state.registry.get_by_public_id(&query.tunnel_id) else {
        return api_error(
            StatusCode::NOT_FOUND,
            format!("unknown tunnel {}", query.tunnel_id),
        );
    };

    let tunnel_url = state
        .config
        .host_pattern
        .url_for(&state.config.url_scheme, &record.subdomain);
    let session = state.sessions.get_or_create(&record.public_id, &tunnel_url);

    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_agent_socket(session, socket))
}

/// Owns one agent control socket until it closes.
async fn run_agent_socket(session: Arc<TunnelSession>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let connection_id = session.attach_agent(tx).await;
    info!(tunnel = %session.tunnel_id(), connection_id, "agent attached");

    let write = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                AgentOutbound::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                AgentOutbound::Frame(frame) => {
                    if sink.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                AgentOutbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if session.agent_frame(&data).await.is_err() {
                    // Session already closed the socket and failed streams.
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(_)) => {
                debug!(tunnel = %session.tunnel_id(), "ignoring text message from agent");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(tunnel = %session.tunnel_id(), "agent socket error: {e}");
                break;
            }
        }
    }

    session.agent_closed(connection_id).await;
    write.abort();
    info!(tunnel = %session.tunnel_id(), connection_id, "agent detached");
}
