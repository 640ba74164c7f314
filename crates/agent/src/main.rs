//! DOtunnel agent: exposes a local HTTP/WebSocket server through a relay.

mod connect;
mod origin;
mod tunnel;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Expose a local server through a DOtunnel relay.
#[derive(Debug, Parser)]
#[command(name = "dotunnel-agent", version)]
pub(crate) struct Args {
    /// Local port to forward to
    #[arg(short, long)]
    port: u16,

    /// Local host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Named tunnel subdomain (ephemeral when omitted)
    #[arg(short, long)]
    pub(crate) subdomain: Option<String>,

    /// Relay service URL, e.g. https://tunnel.io
    #[arg(long, env = "DOTUNNEL_SERVICE_URL")]
    pub(crate) service_url: String,

    /// Agent bearer token
    #[arg(long, env = "DOTUNNEL_TOKEN")]
    pub(crate) token: Option<String>,
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let local_addr: SocketAddr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .context("failed to resolve local address")?
        .next()
        .context("no addresses found for local host")?;

    let mut backoff = INITIAL_BACKOFF;
    let mut first_connect = true;

    loop {
        if !first_connect {
            info!("reconnecting in {backoff:?}");
            tokio::time::sleep(backoff).await;
        }
        first_connect = false;

        match connect::connect_and_run(&args, local_addr, &mut backoff).await {
            Ok(()) => {
                info!("tunnel closed");
                break;
            }
            Err(e) => {
                error!("tunnel error: {e:#}");
                backoff = next_backoff(backoff);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff);
            seen.push(backoff.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 60, 60, 60]);
    }
}
