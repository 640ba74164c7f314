//! Map of live tunnel sessions, keyed by tunnel public id.
//!
//! Sessions are created on first agent attach and stay resident until the
//! process exits; public traffic for a tunnel with no session yet is the
//! same as a tunnel whose agent is offline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use dotunnel_session::{SessionConfig, TunnelSession};

use crate::registry::InMemoryRegistry;

pub struct SessionMap {
    config: SessionConfig,
    registry: Arc<InMemoryRegistry>,
    inner: Mutex<HashMap<String, Arc<TunnelSession>>>,
}

impl SessionMap {
    pub fn new(config: SessionConfig, registry: Arc<InMemoryRegistry>) -> Self {
        Self {
            config,
            registry,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The session for a tunnel, if one was ever attached.
    pub fn get(&self, public_id: &str) -> Option<Arc<TunnelSession>> {
        self.inner.lock().get(public_id).cloned()
    }

    /// The session for a tunnel, created on first attach.
    pub fn get_or_create(&self, public_id: &str, tunnel_url: &str) -> Arc<TunnelSession> {
        let mut sessions = self.inner.lock();
        if let Some(session) = sessions.get(public_id) {
            return session.clone();
        }
        debug!(tunnel = %public_id, "creating session");
        let session = TunnelSession::new(
            public_id,
            tunnel_url,
            self.config.clone(),
            self.registry.clone(),
        );
        sessions.insert(public_id.to_string(), session.clone());
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_session() {
        let registry = Arc::new(InMemoryRegistry::default());
        let map = SessionMap::new(SessionConfig::default(), registry);

        assert!(map.get("tun_a").is_none());
        let first = map.get_or_create("tun_a", "https://a.tunnel.io");
        let second = map.get_or_create("tun_a", "https://a.tunnel.io");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(map.get("tun_a").is_some());
    }
}
