//! Relay configuration and the tunnel host pattern.

use std::net::SocketAddr;
use std::str::FromStr;

use dotunnel_session::SessionConfig;

/// Relay settings, assembled from CLI flags and env vars in `main`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the relay listens on.
    pub listen: SocketAddr,
    /// Pattern the public hostnames match, e.g. `*.tunnel.io`.
    pub host_pattern: HostPattern,
    /// Scheme echoed into tunnel URLs (`https` behind an edge, `http` in dev).
    pub url_scheme: String,
    /// Bearer token agents must present on the connect API. `None` disables
    /// the check (single-tenant/dev setups).
    pub agent_token: Option<String>,
    pub session: SessionConfig,
}

/// A `*.{domain}` wildcard over public tunnel hostnames.
///
/// One label deep: `demo.tunnel.io` matches `*.tunnel.io`,
/// `a.b.tunnel.io` does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    domain: String,
}

/// Error from parsing a host pattern string.
#[derive(Debug, thiserror::Error)]
#[error("host pattern must look like *.example.com, got {0:?}")]
pub struct HostPatternError(String);

impl FromStr for HostPattern {
    type Err = HostPatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let domain = s
            .strip_prefix("*.")
            .filter(|d| !d.is_empty() && !d.contains('*') && !d.contains('/'))
            .ok_or_else(|| HostPatternError(s.to_string()))?;
        Ok(Self {
            domain: domain.to_ascii_lowercase(),
        })
    }
}

impl HostPattern {
    /// Extracts the subdomain from a request's `Host` header value.
    /// Returns `None` for the apex, foreign hosts, and nested labels.
    pub fn subdomain_of(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        let label = host.strip_suffix(&self.domain)?.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label.to_string())
    }

    /// The public URL for a subdomain, echoed to agents in `tunnelUrl`.
    pub fn url_for(&self, scheme: &str, subdomain: &str) -> String {
        format!("{scheme}://{subdomain}.{}", self.domain)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_pattern() {
        let pattern: HostPattern = "*.tunnel.io".parse().unwrap();
        assert_eq!(pattern.domain(), "tunnel.io");
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert!("tunnel.io".parse::<HostPattern>().is_err());
        assert!("*.".parse::<HostPattern>().is_err());
        assert!("*.*.io".parse::<HostPattern>().is_err());
        assert!("".parse::<HostPattern>().is_err());
    }

    #[test]
    fn extracts_subdomain() {
        let pattern: HostPattern = "*.tunnel.io".parse().unwrap();
        assert_eq!(pattern.subdomain_of("demo.tunnel.io"), Some("demo".into()));
        assert_eq!(
            pattern.subdomain_of("Demo.Tunnel.IO"),
            Some("demo".into()),
            "host matching is case-insensitive"
        );
    }

    #[test]
    fn strips_port_before_matching() {
        let pattern: HostPattern = "*.tunnel.io".parse().unwrap();
        assert_eq!(
            pattern.subdomain_of("demo.tunnel.io:8787"),
            Some("demo".into())
        );
    }

    #[test]
    fn rejects_foreign_and_nested_hosts() {
        let pattern: HostPattern = "*.tunnel.io".parse().unwrap();
        assert_eq!(pattern.subdomain_of("tunnel.io"), None);
        assert_eq!(pattern.subdomain_of("example.com"), None);
        assert_eq!(pattern.subdomain_of("a.b.tunnel.io"), None);
        assert_eq!(pattern.subdomain_of("xtunnel.io"), None);
    }

    #[test]
    fn builds_tunnel_urls() {
        let pattern: HostPattern = "*.tunnel.io".parse().unwrap();
        assert_eq!(
            pattern.url_for("https", "demo"),
            "https://demo.tunnel.io"
        );
    }
}
