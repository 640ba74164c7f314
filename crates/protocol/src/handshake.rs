//! The one-shot JSON handshake sent after an agent attach.
//!
//! All other control-socket traffic is binary; this single text message lets
//! the agent bind its side of the connection before the first frame.

use serde::{Deserialize, Serialize};

/// `{"type":"tunnel_ready","connectionId":"…","tunnelUrl":"…"}`
///
/// `connectionId` is a decimal string because the id is a 64-bit value and
/// JSON numbers lose precision past 2^53.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelReady {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub connection_id: String,
    pub tunnel_url: String,
}

impl TunnelReady {
    pub const TYPE: &'static str = "tunnel_ready";

    pub fn new(connection_id: u64, tunnel_url: impl Into<String>) -> Self {
        Self {
            msg_type: Self::TYPE.into(),
            connection_id: connection_id.to_string(),
            tunnel_url: tunnel_url.into(),
        }
    }

    /// Parses the decimal connection id; `None` if the message is not a
    /// well-formed `tunnel_ready`.
    pub fn connection_id(&self) -> Option<u64> {
        if self.msg_type != Self::TYPE {
            return None;
        }
        self.connection_id.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_json_shape() {
        let ready = TunnelReady::new(1712345678901, "https://demo.tunnel.io");
        let json = serde_json::to_string(&ready).unwrap();
        assert!(json.contains(r#""type":"tunnel_ready""#));
        assert!(json.contains(r#""connectionId":"1712345678901""#));
        assert!(json.contains(r#""tunnelUrl":"https://demo.tunnel.io""#));
    }

    #[test]
    fn handshake_roundtrip() {
        let ready = TunnelReady::new(u64::MAX, "https://x.tunnel.io");
        let parsed: TunnelReady =
            serde_json::from_str(&serde_json::to_string(&ready).unwrap()).unwrap();
        assert_eq!(parsed, ready);
        assert_eq!(parsed.connection_id(), Some(u64::MAX));
    }

    #[test]
    fn wrong_type_yields_no_connection_id() {
        let msg = TunnelReady {
            msg_type: "something_else".into(),
            connection_id: "5".into(),
            tunnel_url: String::new(),
        };
        assert_eq!(msg.connection_id(), None);
    }
}
