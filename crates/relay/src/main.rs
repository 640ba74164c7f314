use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dotunnel_relay::{app, AppState, HostPattern, RelayConfig};
use dotunnel_session::SessionConfig;

/// DOtunnel relay: exposes local servers through public tunnel hostnames.
#[derive(Debug, Parser)]
#[command(name = "dotunnel-relay", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "DOTUNNEL_LISTEN", default_value = "0.0.0.0:8787")]
    listen: SocketAddr,

    /// Public hostname pattern, e.g. *.tunnel.io
    #[arg(long, env = "DOTUNNEL_HOST_PATTERN")]
    host_pattern: HostPattern,

    /// Scheme echoed into tunnel URLs
    #[arg(long, env = "DOTUNNEL_URL_SCHEME", default_value = "https")]
    url_scheme: String,

    /// Bearer token agents must present; omit to disable the check
    #[arg(long, env = "DOTUNNEL_AGENT_TOKEN")]
    agent_token: Option<String>,

    /// Cap on concurrent streams per tunnel
    #[arg(long, default_value_t = 100)]
    max_concurrent_streams: usize,

    /// HTTP and upgrade deadline in milliseconds
    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        listen: args.listen,
        host_pattern: args.host_pattern,
        url_scheme: args.url_scheme,
        agent_token: args.agent_token,
        session: SessionConfig {
            max_concurrent_streams: args.max_concurrent_streams,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
        },
    };

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("relay listening on {}", listener.local_addr()?);
    info!("routing tunnel hosts *.{}", config.host_pattern.domain());

    let state = AppState::new(config);
    axum::serve(listener, app(state))
        .await
        .context("server error")?;
    Ok(())
}
