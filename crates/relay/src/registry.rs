//! In-memory tunnel registry.
//!
//! Implements the [`TunnelRegistry`] interface the session consumes, plus
//! the creation calls the connect API needs. A database-backed registry is
//! the external registry collaborator's concern; this one covers dev and
//! single-process deployments and loses nothing the sessions can't rebuild.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use dotunnel_session::{RegistryError, TunnelRecord, TunnelRegistry, TunnelStatus};

const EPHEMERAL_SUBDOMAIN_LEN: usize = 10;
const SUBDOMAIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    /// subdomain -> record
    by_subdomain: HashMap<String, TunnelRecord>,
    /// public id -> subdomain
    by_public_id: HashMap<String, String>,
}

impl InMemoryRegistry {
    /// Returns the tunnel for `subdomain`, creating it on first use; with
    /// no subdomain requested, creates an ephemeral tunnel under a random
    /// one. Ownership is first-come here; real multi-user semantics live in
    /// the registry collaborator.
    pub fn find_or_create(&self, subdomain: Option<String>) -> TunnelRecord {
        let mut tables = self.inner.lock();

        let subdomain = match subdomain {
            Some(subdomain) => subdomain,
            None => loop {
                let candidate = random_subdomain();
                if !tables.by_subdomain.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if let Some(record) = tables.by_subdomain.get(&subdomain) {
            return record.clone();
        }

        let record = TunnelRecord {
            public_id: format!("tun_{}", uuid::Uuid::new_v4().simple()),
            subdomain: subdomain.clone(),
            owner_id: None,
            status: TunnelStatus::Offline,
        };
        debug!(subdomain = %record.subdomain, id = %record.public_id, "registered tunnel");
        tables
            .by_public_id
            .insert(record.public_id.clone(), subdomain.clone());
        tables.by_subdomain.insert(subdomain, record.clone());
        record
    }

    pub fn get_by_public_id(&self, public_id: &str) -> Option<TunnelRecord> {
        let tables = self.inner.lock();
        let subdomain = tables.by_public_id.get(public_id)?;
        tables.by_subdomain.get(subdomain).cloned()
    }
}

#[async_trait]
impl TunnelRegistry for InMemoryRegistry {
    async fn find_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<TunnelRecord>, RegistryError> {
        Ok(self.inner.lock().by_subdomain.get(subdomain).cloned())
    }

    async fn mark_status(
        &self,
        public_id: &str,
        status: TunnelStatus,
        _at: SystemTime,
    ) -> Result<(), RegistryError> {
        let mut tables = self.inner.lock();
        let Some(subdomain) = tables.by_public_id.get(public_id).cloned() else {
            // Idempotent: a status write for a deleted tunnel is a no-op.
            return Ok(());
        };
        if let Some(record) = tables.by_subdomain.get_mut(&subdomain) {
            record.status = status;
        }
        Ok(())
    }
}

fn random_subdomain() -> String {
    let mut rng = rand::thread_rng();
    (0..EPHEMERAL_SUBDOMAIN_LEN)
        .map(|_| SUBDOMAIN_ALPHABET[rng.gen_range(0..SUBDOMAIN_ALPHABET.len())] as char)
        .collect()
}

/// Validates a caller-requested subdomain: lowercase alphanumerics and
/// hyphens, no leading/trailing hyphen, 1..=63 chars.
pub(crate) fn valid_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_or_create_is_stable_per_subdomain() {
        let registry = InMemoryRegistry::default();
        let first = registry.find_or_create(Some("demo".into()));
        let second = registry.find_or_create(Some("demo".into()));
        assert_eq!(first.public_id, second.public_id);
    }

    #[tokio::test]
    async fn ephemeral_tunnels_get_distinct_subdomains() {
        let registry = InMemoryRegistry::default();
        let a = registry.find_or_create(None);
        let b = registry.find_or_create(None);
        assert_ne!(a.subdomain, b.subdomain);
        assert_eq!(a.subdomain.len(), EPHEMERAL_SUBDOMAIN_LEN);
        assert!(valid_subdomain(&a.subdomain));
    }

    #[tokio::test]
    async fn lookup_by_public_id_and_subdomain_agree() {
        let registry = InMemoryRegistry::default();
        let record = registry.find_or_create(Some("demo".into()));
        assert_eq!(
            registry.get_by_public_id(&record.public_id),
            Some(record.clone())
        );
        assert_eq!(
            registry.find_by_subdomain("demo").await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn mark_status_updates_record() {
        let registry = InMemoryRegistry::default();
        let record = registry.find_or_create(Some("demo".into()));
        registry
            .mark_status(&record.public_id, TunnelStatus::Online, SystemTime::now())
            .await
            .unwrap();
        let found = registry.find_by_subdomain("demo").await.unwrap().unwrap();
        assert_eq!(found.status, TunnelStatus::Online);
    }

    #[tokio::test]
    async fn mark_status_for_unknown_tunnel_is_a_noop() {
        let registry = InMemoryRegistry::default();
        registry
            .mark_status("tun_missing", TunnelStatus::Online, SystemTime::now())
            .await
            .unwrap();
    }

    #[test]
    fn subdomain_validation() {
        assert!(valid_subdomain("demo"));
        assert!(valid_subdomain("my-app-2"));
        assert!(!valid_subdomain(""));
        assert!(!valid_subdomain("-demo"));
        assert!(!valid_subdomain("demo-"));
        assert!(!valid_subdomain("Demo"));
        assert!(!valid_subdomain("has.dot"));
        assert!(!valid_subdomain(&"a".repeat(64)));
    }
}
