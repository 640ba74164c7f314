//! Relay end-to-end tests: real listener, real agent socket, real clients.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use dotunnel_protocol::{
    wire, ControlFrame, Envelope, FrameBody, HttpFrame, TunnelReady, WsFrame, WsOpcode,
};
use dotunnel_relay::{app, AppState, RelayConfig};
use dotunnel_session::SessionConfig;

type AgentWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(agent_token: Option<String>) -> SocketAddr {
    let config = RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        host_pattern: "*.tunnel.test".parse().unwrap(),
        url_scheme: "http".into(),
        agent_token,
        session: SessionConfig::default(),
    };
    let state = AppState::new(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectInfo {
    tunnel_id: String,
    tunnel_url: String,
    subdomain: String,
}

async fn create_tunnel(addr: SocketAddr, subdomain: &str) -> ConnectInfo {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/_api/tunnel/connect"))
        .json(&serde_json::json!({ "subdomain": subdomain }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    response.json().await.unwrap()
}

/// Dials the control socket and consumes the tunnel_ready handshake.
async fn attach_agent(addr: SocketAddr, tunnel_id: &str) -> (AgentWs, u64) {
    let url = format!("ws://{addr}/_api/tunnel/connect?tunnelId={tunnel_id}");
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    let handshake = match ws.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => text,
        other => panic!("expected tunnel_ready, got {other:?}"),
    };
    let ready: TunnelReady = serde_json::from_str(&handshake).unwrap();
    let connection_id = ready.connection_id().expect("well-formed handshake");
    (ws, connection_id)
}

fn frame(connection_id: u64, stream_id: u32, next_seq: &mut u32, body: FrameBody) -> WsMessage {
    let envelope = Envelope::new(connection_id, stream_id, *next_seq, body);
    *next_seq += 1;
    WsMessage::Binary(wire::encode(&envelope).into())
}

/// A minimal origin stand-in: answers HTTP requests with a fixed body,
/// accepts WebSocket upgrades, and echoes ws text frames uppercased.
async fn run_echo_agent(mut ws: AgentWs, connection_id: u64) {
    let mut next_seq = 0u32;
    let mut uris: std::collections::HashMap<u32, String> = std::collections::HashMap::new();

    while let Some(Ok(message)) = ws.next().await {
        let WsMessage::Binary(data) = message else {
            continue;
        };
        let envelope = wire::decode(&data).unwrap();
        let stream_id = envelope.stream_id;
        match envelope.body {
            FrameBody::Http(HttpFrame::RequestInit { uri, headers, .. }) => {
                let is_upgrade = headers.iter().any(|(name, value)| {
                    name.eq_ignore_ascii_case("upgrade")
                        && value.eq_ignore_ascii_case(b"websocket")
                });
                if is_upgrade {
                    ws.send(frame(
                        connection_id,
                        stream_id,
                        &mut next_seq,
                        FrameBody::Http(HttpFrame::ResponseInit {
                            status: 101,
                            has_body: false,
                            content_length: 0,
                            headers: vec![],
                        }),
                    ))
                    .await
                    .unwrap();
                } else {
                    uris.insert(stream_id, uri);
                }
            }
            FrameBody::Http(HttpFrame::RequestEnd) => {
                let uri = uris.remove(&stream_id).unwrap_or_default();
                let body = format!("hello from {uri}");
                ws.send(frame(
                    connection_id,
                    stream_id,
                    &mut next_seq,
                    FrameBody::Http(HttpFrame::ResponseInit {
                        status: 200,
                        has_body: true,
                        content_length: body.len() as u64,
                        headers: vec![("content-type".into(), b"text/plain".to_vec())],
                    }),
                ))
                .await
                .unwrap();
                ws.send(frame(
                    connection_id,
                    stream_id,
                    &mut next_seq,
                    FrameBody::Http(HttpFrame::ResponseBodyChunk {
                        seq: 0,
                        is_last: true,
                        data: body.into_bytes(),
                    }),
                ))
                .await
                .unwrap();
                ws.send(frame(
                    connection_id,
                    stream_id,
                    &mut next_seq,
                    FrameBody::Http(HttpFrame::ResponseEnd),
                ))
                .await
                .unwrap();
            }
            FrameBody::Ws(ws_frame) if ws_frame.opcode == WsOpcode::Text => {
                let text = String::from_utf8(ws_frame.payload).unwrap().to_uppercase();
                ws.send(frame(
                    connection_id,
                    stream_id,
                    &mut next_seq,
                    FrameBody::Ws(WsFrame::message(WsOpcode::Text, text.into_bytes())),
                ))
                .await
                .unwrap();
            }
            FrameBody::Control(ControlFrame::Ping { data }) => {
                ws.send(frame(
                    connection_id,
                    0,
                    &mut next_seq,
                    FrameBody::Control(ControlFrame::Pong { data }),
                ))
                .await
                .unwrap();
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn http_roundtrip_through_relay() {
    let addr = spawn_relay(None).await;
    let info = create_tunnel(addr, "demo").await;
    assert_eq!(info.subdomain, "demo");
    assert_eq!(info.tunnel_url, "http://demo.tunnel.test");

    let (ws, connection_id) = attach_agent(addr, &info.tunnel_id).await;
    tokio::spawn(run_echo_agent(ws, connection_id));

    let client = reqwest::Client::builder()
        .resolve("demo.tunnel.test", addr)
        .build()
        .unwrap();
    let response = client
        .get(format!("http://demo.tunnel.test:{}/hello?x=1", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "hello from /hello?x=1");
}

#[tokio::test]
async fn websocket_roundtrip_through_relay() {
    let addr = spawn_relay(None).await;
    let info = create_tunnel(addr, "wsdemo").await;
    let (ws, connection_id) = attach_agent(addr, &info.tunnel_id).await;
    tokio::spawn(run_echo_agent(ws, connection_id));

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = format!("ws://127.0.0.1:{}/chat", addr.port())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Host", "wsdemo.tunnel.test".parse().unwrap());

    let (mut public, response) = connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);

    public
        .send(WsMessage::Text("ping".into()))
        .await
        .unwrap();
    match public.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => assert_eq!(text.as_str(), "PING"),
        other => panic!("expected text echo, got {other:?}"),
    }

    public.close(None).await.unwrap();
}

#[tokio::test]
async fn offline_tunnel_yields_502() {
    let addr = spawn_relay(None).await;
    let _info = create_tunnel(addr, "silent").await;

    let client = reqwest::Client::builder()
        .resolve("silent.tunnel.test", addr)
        .build()
        .unwrap();
    let response = client
        .get(format!("http://silent.tunnel.test:{}/", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "Tunnel offline");
}

#[tokio::test]
async fn unknown_host_yields_404() {
    let addr = spawn_relay(None).await;

    let client = reqwest::Client::builder()
        .resolve("other.example.com", addr)
        .build()
        .unwrap();
    let response = client
        .get(format!("http://other.example.com:{}/", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn connect_requires_bearer_token_when_configured() {
    let addr = spawn_relay(Some("s3cret".into())).await;
    let client = reqwest::Client::new();

    let denied = client
        .post(format!("http://{addr}/_api/tunnel/connect"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = client
        .post(format!("http://{addr}/_api/tunnel/connect"))
        .bearer_auth("s3cret")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let info: ConnectInfo = allowed.json().await.unwrap();
    assert!(!info.subdomain.is_empty());
    assert!(info.tunnel_id.starts_with("tun_"));
}

#[tokio::test]
async fn invalid_subdomain_is_rejected() {
    let addr = spawn_relay(None).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/_api/tunnel/connect"))
        .json(&serde_json::json!({ "subdomain": "Bad.Name" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn agent_reconnect_displaces_old_socket() {
    let addr = spawn_relay(None).await;
    let info = create_tunnel(addr, "flappy").await;

    let (mut old_ws, _old_id) = attach_agent(addr, &info.tunnel_id).await;
    let (new_ws, new_id) = attach_agent(addr, &info.tunnel_id).await;
    tokio::spawn(run_echo_agent(new_ws, new_id));

    // The displaced socket sees goAway and then a close frame.
    let mut saw_go_away = false;
    while let Some(Ok(message)) = old_ws.next().await {
        match message {
            WsMessage::Binary(data) => {
                let envelope = wire::decode(&data).unwrap();
                if let FrameBody::Control(ControlFrame::GoAway { reason, .. }) = envelope.body {
                    assert_eq!(reason, "Replaced by new connection");
                    saw_go_away = true;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    assert!(saw_go_away, "old agent should receive goAway");

    // Traffic flows through the replacement.
    let client = reqwest::Client::builder()
        .resolve("flappy.tunnel.test", addr)
        .build()
        .unwrap();
    let response = client
        .get(format!("http://flappy.tunnel.test:{}/after", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
