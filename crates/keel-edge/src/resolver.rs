//! SNI certificate selection
//!
//! The resolver reads the certificate store on every handshake. Signing keys
//! are cached per store revision so a swap in the store is picked up by the
//! next handshake without restarting the listener.

use crate::error::{EdgeError, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use keel_certs::CertStore;
use keel_types::Certificate;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct CachedKey {
    key: Arc<CertifiedKey>,
    /// Leaf fingerprint the key was built from
    fingerprint: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

#[derive(Default)]
struct KeyCache {
    revision: u64,
    keys: HashMap<String, CachedKey>,
}

/// Picks the certificate for a handshake by SNI
pub struct SniResolver {
    store: Arc<CertStore>,
    cache: ArcSwap<KeyCache>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.load();
        f.debug_struct("SniResolver")
            .field("revision", &cache.revision)
            .field("domains", &cache.keys.len())
            .finish()
    }
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>) -> Self {
        let resolver = Self {
            store,
            cache: ArcSwap::from_pointee(KeyCache::default()),
        };
        resolver.refresh();
        resolver
    }

    /// Key for `server_name`, or `None` to refuse the handshake.
    ///
    /// Exact names win over a `*.` certificate for the parent domain. A
    /// certificate outside its validity window is never served.
    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let name = server_name?.trim_end_matches('.').to_ascii_lowercase();
        if self.cache.load().revision != self.store.revision() {
            self.refresh();
        }

        let cache = self.cache.load();
        let wildcard = name.split_once('.').map(|(_, parent)| format!("*.{}", parent));
        let entry = cache
            .keys
            .get(&name)
            .or_else(|| wildcard.as_ref().and_then(|w| cache.keys.get(w)))?;

        let now = Utc::now();
        if entry.not_before <= now && now < entry.not_after {
            Some(Arc::clone(&entry.key))
        } else {
            debug!(server_name = %name, "Certificate outside validity window");
            None
        }
    }

    fn refresh(&self) {
        let revision = self.store.revision();
        let snapshot = self.store.snapshot();
        let previous = self.cache.load();

        let mut keys = HashMap::with_capacity(snapshot.len());
        for cert in snapshot.iter() {
            let domain = cert.domain.to_ascii_lowercase();
            if let Some(cached) = previous.keys.get(&domain) {
                if cached.fingerprint == cert.fingerprint {
                    keys.insert(
                        domain,
                        CachedKey {
                            key: Arc::clone(&cached.key),
                            fingerprint: cached.fingerprint.clone(),
                            not_before: cached.not_before,
                            not_after: cached.not_after,
                        },
                    );
                    continue;
                }
            }
            match certified_key(cert) {
                Ok(key) => {
                    keys.insert(
                        domain,
                        CachedKey {
                            key: Arc::new(key),
                            fingerprint: cert.fingerprint.clone(),
                            not_before: cert.not_before,
                            not_after: cert.not_after,
                        },
                    );
                }
                Err(e) => warn!(domain = %cert.domain, error = %e, "Skipping unusable certificate"),
            }
        }

        debug!(revision, domains = keys.len(), "SNI key cache rebuilt");
        self.cache.store(Arc::new(KeyCache { revision, keys }));
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

/// Build a signing key and chain from a stored certificate
pub fn certified_key(cert: &Certificate) -> Result<CertifiedKey> {
    let chain = CertificateDer::pem_slice_iter(cert.chain_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Tls(format!("{}: bad certificate chain: {}", cert.domain, e)))?;
    if chain.is_empty() {
        return Err(EdgeError::Tls(format!("{}: empty certificate chain", cert.domain)));
    }
    let key = PrivateKeyDer::from_pem_slice(cert.key_pem.as_bytes())
        .map_err(|e| EdgeError::Tls(format!("{}: bad private key: {}", cert.domain, e)))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Server configuration for the TLS listener, advertising h2 and http/1.1
pub fn server_config(resolver: Arc<SniResolver>) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_certs::{parse_certificate, ChallengeResponder, LocalAuthority};
    use keel_types::ChallengeType;
    use std::time::Duration;

    fn authority() -> LocalAuthority {
        LocalAuthority::new("test-ca", Arc::new(ChallengeResponder::new())).unwrap()
    }

    fn install(store: &CertStore, authority: &LocalAuthority, domain: &str) {
        let issued = authority.sign(domain).unwrap();
        store.install(
            parse_certificate(domain, &issued.chain_pem, &issued.key_pem, ChallengeType::Http01).unwrap(),
        );
    }

    #[test]
    fn test_missing_certificate_refuses() {
        let resolver = SniResolver::new(Arc::new(CertStore::new()));
        assert!(resolver.lookup(Some("kibana-labs.example.com")).is_none());
        assert!(resolver.lookup(None).is_none());
    }

    #[test]
    fn test_picks_up_installed_certificate() {
        let store = Arc::new(CertStore::new());
        let resolver = SniResolver::new(store.clone());
        assert!(resolver.lookup(Some("kibana-labs.example.com")).is_none());

        install(&store, &authority(), "kibana-labs.example.com");
        let key = resolver.lookup(Some("Kibana-Labs.example.com")).unwrap();
        assert_eq!(key.cert.len(), 2);
        assert!(resolver.lookup(Some("other.example.com")).is_none());
    }

    #[test]
    fn test_key_reused_across_unrelated_installs() {
        let store = Arc::new(CertStore::new());
        let authority = authority();
        let resolver = SniResolver::new(store.clone());
        install(&store, &authority, "a.example.com");
        let first = resolver.lookup(Some("a.example.com")).unwrap();

        install(&store, &authority, "b.example.com");
        let again = resolver.lookup(Some("a.example.com")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(resolver.lookup(Some("b.example.com")).is_some());
    }

    #[test]
    fn test_reissue_in_same_window_serves_new_key() {
        let store = Arc::new(CertStore::new());
        let authority = authority();
        let resolver = SniResolver::new(store.clone());

        let first = authority.sign("a.example.com").unwrap();
        let first =
            parse_certificate("a.example.com", &first.chain_pem, &first.key_pem, ChallengeType::Http01).unwrap();
        store.install(first.clone());
        let served = resolver.lookup(Some("a.example.com")).unwrap();

        let second = authority.sign("a.example.com").unwrap();
        let mut second =
            parse_certificate("a.example.com", &second.chain_pem, &second.key_pem, ChallengeType::Http01).unwrap();
        second.not_before = first.not_before;
        second.not_after = first.not_after;
        assert_ne!(second.fingerprint, first.fingerprint);
        store.install(second);

        let reissued = resolver.lookup(Some("a.example.com")).unwrap();
        assert!(!Arc::ptr_eq(&served, &reissued));
        assert_ne!(served.cert[0], reissued.cert[0]);
    }

    #[test]
    fn test_expired_certificate_is_not_served() {
        let store = Arc::new(CertStore::new());
        let authority = authority().with_validity(Duration::from_secs(60));
        let issued = authority.sign("old.example.com").unwrap();
        let mut cert =
            parse_certificate("old.example.com", &issued.chain_pem, &issued.key_pem, ChallengeType::Http01)
                .unwrap();
        cert.not_after = Utc::now() - chrono::Duration::seconds(1);
        store.install(cert);

        let resolver = SniResolver::new(store);
        assert!(resolver.lookup(Some("old.example.com")).is_none());
    }

    #[test]
    fn test_server_config_advertises_alpn() {
        let resolver = Arc::new(SniResolver::new(Arc::new(CertStore::new())));
        let config = server_config(resolver).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
