//! Certificate store
//!
//! Readers load an immutable snapshot; the certificate manager installs new
//! certificates by swapping in a new snapshot. A revision counter on a
//! `watch` channel tells the edge router when to rebuild.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use keel_types::{Certificate, CertificateSummary};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Immutable view of every installed certificate
#[derive(Debug, Clone, Default)]
pub struct CertSnapshot {
    certs: BTreeMap<String, Arc<Certificate>>,
}

impl CertSnapshot {
    pub fn get(&self, domain: &str) -> Option<&Arc<Certificate>> {
        self.certs.get(&domain.to_ascii_lowercase())
    }

    /// Certificate for `domain` if it is currently valid
    pub fn valid_at(&self, domain: &str, now: DateTime<Utc>) -> Option<&Arc<Certificate>> {
        self.get(domain).filter(|c| c.is_valid_at(now))
    }

    pub fn valid(&self, domain: &str) -> Option<&Arc<Certificate>> {
        self.valid_at(domain, Utc::now())
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.certs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Certificate>> {
        self.certs.values()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// Atomically swapped certificate store
pub struct CertStore {
    current: ArcSwap<CertSnapshot>,
    revision: watch::Sender<u64>,
}

impl CertStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(CertSnapshot::default()),
            revision,
        }
    }

    pub fn snapshot(&self) -> Arc<CertSnapshot> {
        self.current.load_full()
    }

    pub fn get(&self, domain: &str) -> Option<Arc<Certificate>> {
        self.current.load().get(domain).cloned()
    }

    /// Subscribe to store revisions
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Install or replace the certificate for its domain
    pub fn install(&self, cert: Certificate) {
        let domain = cert.domain.to_ascii_lowercase();
        let cert = Arc::new(cert);
        self.current.rcu(|snapshot| {
            let mut next = CertSnapshot::clone(snapshot);
            next.certs.insert(domain.clone(), Arc::clone(&cert));
            next
        });
        debug!(%domain, not_after = %cert.not_after, "Certificate installed");
        self.bump();
    }

    pub fn remove(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        if self.current.load().get(&domain).is_none() {
            return false;
        }
        self.current.rcu(|snapshot| {
            let mut next = CertSnapshot::clone(snapshot);
            next.certs.remove(&domain);
            next
        });
        self.bump();
        true
    }

    /// Operator view, by domain
    pub fn summaries(&self) -> Vec<CertificateSummary> {
        self.current.load().iter().map(|c| c.summary()).collect()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}
