//! The tunnel-registry interface the session consumes.
//!
//! The registry itself (database, ownership, auth) is an external
//! collaborator; the session only looks tunnels up and flips their
//! online/offline status. Status writes are idempotent and the session
//! never blocks its own liveness on them.

use std::time::SystemTime;

use async_trait::async_trait;

/// Tunnel liveness as recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Online,
    Offline,
}

/// One registered tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelRecord {
    /// Opaque stable id (`tun_…`).
    pub public_id: String,
    pub subdomain: String,
    /// Owner account, if the auth collaborator assigned one.
    pub owner_id: Option<String>,
    pub status: TunnelStatus,
}

/// Registry lookup/update failure. Logged, never fatal to a session.
#[derive(Debug, thiserror::Error)]
#[error("registry unavailable: {0}")]
pub struct RegistryError(pub String);

/// What the session needs from the registry collaborator.
#[async_trait]
pub trait TunnelRegistry: Send + Sync {
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<TunnelRecord>, RegistryError>;

    async fn mark_status(
        &self,
        public_id: &str,
        status: TunnelStatus,
        at: SystemTime,
    ) -> Result<(), RegistryError>;
}

/// Registry that records nothing. For tests and single-tenant setups.
#[derive(Debug, Default)]
pub struct NullRegistry;

#[async_trait]
impl TunnelRegistry for NullRegistry {
    async fn find_by_subdomain(&self, _subdomain: &str) -> Result<Option<TunnelRecord>, RegistryError> {
        Ok(None)
    }

    async fn mark_status(
        &self,
        _public_id: &str,
        _status: TunnelStatus,
        _at: SystemTime,
    ) -> Result<(), RegistryError> {
        Ok(())
    }
}
