//! Connect flow: tunnel creation via the relay API, then the control socket.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::info;
use url::Url;

use dotunnel_protocol::MAX_FRAME_SIZE;

use crate::{tunnel, Args, INITIAL_BACKOFF};

/// `POST /_api/tunnel/connect` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    tunnel_id: String,
    tunnel_url: String,
    #[allow(dead_code)]
    subdomain: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Creates (or looks up) the tunnel, dials the control socket, and runs the
/// tunnel loop until it ends. Resets `backoff` once the socket is up.
pub(crate) async fn connect_and_run(
    args: &Args,
    local_addr: SocketAddr,
    backoff: &mut Duration,
) -> Result<()> {
    info!("connecting to {}", args.service_url);
    let service_url = args.service_url.trim_end_matches('/');

    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("{service_url}/_api/tunnel/connect"))
        .json(&match &args.subdomain {
            Some(subdomain) => serde_json::json!({ "subdomain": subdomain }),
            None => serde_json::json!({}),
        });
    if let Some(token) = &args.token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .context("failed to reach tunnel service")?;
    if !response.status().is_success() {
        let status = response.status();
        let error = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".into());
        bail!("tunnel create failed ({status}): {error}");
    }
    let info: ConnectResponse = response
        .json()
        .await
        .context("failed to parse tunnel response")?;
    info!("tunnel created: {}", info.tunnel_url);

    let mut ws_request = control_socket_url(service_url, &info.tunnel_id)?
        .into_client_request()
        .context("failed to build control socket request")?;
    if let Some(token) = &args.token {
        ws_request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {token}")
                .parse()
                .context("token is not a valid header value")?,
        );
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_FRAME_SIZE);
    ws_config.max_frame_size = Some(MAX_FRAME_SIZE);
    let (ws, _) = tokio_tungstenite::connect_async_with_config(ws_request, Some(ws_config), false)
        .await
        .context("failed to establish control socket")?;

    // The control socket is up: the next failure starts backoff over.
    *backoff = INITIAL_BACKOFF;

    println!();
    println!("  Public URL: {}", info.tunnel_url);
    println!("  Forwarding: http://{local_addr}");
    println!();
    println!("Press Ctrl+C to stop the tunnel.");
    println!();

    tunnel::run(ws, local_addr).await
}

/// Derives the websocket attach URL from the service URL.
fn control_socket_url(service_url: &str, tunnel_id: &str) -> Result<String> {
    let url = Url::parse(service_url).context("invalid service URL")?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => bail!("unsupported service URL scheme {other:?}"),
    };
    let host = url.host_str().context("service URL has no host")?;
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    Ok(format!(
        "{scheme}://{host}{port}/_api/tunnel/connect?tunnelId={tunnel_id}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_socket_url_maps_schemes() {
        assert_eq!(
            control_socket_url("https://tunnel.io", "tun_1").unwrap(),
            "wss://tunnel.io/_api/tunnel/connect?tunnelId=tun_1"
        );
        assert_eq!(
            control_socket_url("http://localhost:8787", "tun_2").unwrap(),
            "ws://localhost:8787/_api/tunnel/connect?tunnelId=tun_2"
        );
    }

    #[test]
    fn control_socket_url_rejects_odd_schemes() {
        assert!(control_socket_url("ftp://tunnel.io", "tun_1").is_err());
        assert!(control_socket_url("not a url", "tun_1").is_err());
    }
}
