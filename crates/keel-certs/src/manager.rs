//! Certificate Manager - obtains, renews and persists per-domain certificates
//!
//! The manager is the only writer of the [`CertStore`]. Issuance runs an
//! HTTP-01 validation through the configured [`Issuer`]; concurrent requests
//! for one domain share a single issuance.

use crate::challenge::{key_authorization, new_token, ChallengeResponder};
use crate::config::CertConfig;
use crate::error::{CertError, Result};
use crate::issuer::{IssuanceRequest, IssuedCertificate, Issuer, OrderStatus};
use crate::pem::parse_certificate;
use crate::store::CertStore;
use chrono::Utc;
use dashmap::DashMap;
use keel_types::{
    Certificate, CertificateSummary, ChallengeType, EventEnvelope, EventSource, KeelEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const CERT_SUFFIX: &str = ".crt.pem";
const KEY_SUFFIX: &str = ".key.pem";

/// Certificate manager
pub struct CertificateManager {
    config: CertConfig,
    store: Arc<CertStore>,
    responder: Arc<ChallengeResponder>,
    issuer: Arc<dyn Issuer>,
    managed: DashMap<String, ()>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl CertificateManager {
    pub fn new(
        config: CertConfig,
        store: Arc<CertStore>,
        responder: Arc<ChallengeResponder>,
        issuer: Arc<dyn Issuer>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(4096);
        Self {
            config,
            store,
            responder,
            issuer,
            managed: DashMap::new(),
            inflight: DashMap::new(),
            event_tx,
        }
    }

    pub fn store(&self) -> Arc<CertStore> {
        Arc::clone(&self.store)
    }

    pub fn responder(&self) -> Arc<ChallengeResponder> {
        Arc::clone(&self.responder)
    }

    /// Subscribe to certificate events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Domains kept renewed by the renewal loop
    pub fn managed(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.managed.iter().map(|d| d.key().clone()).collect();
        domains.sort();
        domains
    }

    pub fn certificates(&self) -> Vec<CertificateSummary> {
        self.store.summaries()
    }

    /// Return a certificate for `domain` with more than `renew_before`
    /// remaining, issuing one if needed.
    ///
    /// On failure the previous certificate, if any, stays installed.
    #[instrument(skip(self))]
    pub async fn ensure(&self, domain: &str) -> Result<Arc<Certificate>> {
        let domain = normalize_domain(domain)?;
        self.managed.insert(domain.clone(), ());

        if let Some(cert) = self.fresh(&domain) {
            return Ok(cert);
        }

        let lock = Arc::clone(self.inflight.entry(domain.clone()).or_default().value());
        let _guard = lock.lock().await;

        // issued while we waited
        if let Some(cert) = self.fresh(&domain) {
            debug!("Certificate issued by concurrent request");
            return Ok(cert);
        }

        match self.issue(&domain).await {
            Ok(cert) => Ok(cert),
            Err(e) => {
                let reason = e.to_string();
                error!(%domain, %reason, still_served = self.store.snapshot().valid(&domain).is_some(), "Certificate issuance failed");
                self.emit(KeelEvent::ChallengeFailed {
                    domain: domain.clone(),
                    reason,
                });
                Err(e)
            }
        }
    }

    /// Renew every managed domain that is missing a certificate or within
    /// `renew_before` of expiry. Returns the domains renewed.
    pub async fn renew_due(&self) -> Vec<String> {
        let now = Utc::now();
        let mut renewed = Vec::new();
        for domain in self.managed() {
            let due = self
                .store
                .get(&domain)
                .map_or(true, |c| c.needs_renewal_at(now, self.config.renew_before));
            if !due {
                continue;
            }

            let expires_in_days = self
                .store
                .get(&domain)
                .map_or(0, |c| (c.not_after - now).num_days());
            info!(%domain, expires_in_days, "Certificate renewal due");
            self.emit(KeelEvent::CertificateRenewalScheduled {
                domain: domain.clone(),
                expires_in_days,
            });

            match self.ensure(&domain).await {
                Ok(_) => renewed.push(domain),
                Err(e) => warn!(%domain, error = %e, "Renewal failed, will retry"),
            }
        }
        renewed
    }

    /// Check managed domains on `renewal_check_interval` until shutdown
    pub fn spawn_renewal_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.renewal_check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.config.renewal_check_interval, "Certificate renewal loop started");

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let renewed = self.renew_due().await;
                        if !renewed.is_empty() {
                            info!(count = renewed.len(), "Certificates renewed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Certificate renewal loop stopped");
        })
    }

    /// Install certificates persisted in `storage_dir`. Expired or unreadable
    /// files are skipped. Returns the number installed.
    pub async fn load_from_dir(&self) -> Result<usize> {
        let Some(dir) = self.config.storage_dir.clone() else {
            return Ok(0);
        };
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(domain) = file_name.to_str().and_then(|n| n.strip_suffix(CERT_SUFFIX)) else {
                continue;
            };
            match self.load_one(&dir, domain).await {
                Ok(cert) if cert.is_valid() => {
                    self.managed.insert(cert.domain.clone(), ());
                    self.store.install(cert);
                    loaded += 1;
                }
                Ok(cert) => warn!(domain = %cert.domain, not_after = %cert.not_after, "Skipping expired certificate"),
                Err(e) => warn!(%domain, error = %e, "Skipping unreadable certificate"),
            }
        }
        info!(loaded, dir = %dir.display(), "Certificates loaded");
        Ok(loaded)
    }

    async fn load_one(&self, dir: &Path, domain: &str) -> Result<Certificate> {
        let (cert_path, key_path) = paths(dir, domain);
        let chain_pem = tokio::fs::read_to_string(cert_path).await?;
        let key_pem = tokio::fs::read_to_string(key_path).await?;
        parse_certificate(domain, &chain_pem, &key_pem, ChallengeType::Http01)
    }

    async fn issue(&self, domain: &str) -> Result<Arc<Certificate>> {
        let token = new_token();
        let key_authorization = key_authorization(&token, self.issuer.account_thumbprint());
        self.responder.publish(domain, &token, &key_authorization);

        let request = IssuanceRequest {
            domain: domain.to_string(),
            token: token.clone(),
            key_authorization,
        };
        let validated = self.validate(&request).await;
        self.responder.withdraw(&token);
        let issued = validated?;

        let cert = parse_certificate(domain, &issued.chain_pem, &issued.key_pem, ChallengeType::Http01)?;
        if !cert.is_valid() {
            return Err(CertError::InvalidCertificate {
                domain: domain.to_string(),
                reason: format!("not valid now ({} to {})", cert.not_before, cert.not_after),
            });
        }

        if let Err(e) = self.persist(&cert).await {
            warn!(%domain, error = %e, "Failed to persist certificate");
        }

        let not_after = cert.not_after;
        self.store.install(cert);
        info!(%domain, %not_after, issuer = self.issuer.name(), "Certificate issued");
        self.emit(KeelEvent::CertificateIssued {
            domain: domain.to_string(),
            not_after,
        });

        self.store
            .get(domain)
            .ok_or_else(|| CertError::Storage(format!("{} missing after install", domain)))
    }

    async fn validate(&self, request: &IssuanceRequest) -> Result<IssuedCertificate> {
        let order = self.issuer.request(request).await?;
        let poll = async {
            loop {
                match self.issuer.poll(&order).await? {
                    OrderStatus::Pending => tokio::time::sleep(self.config.poll_interval).await,
                    OrderStatus::Valid(issued) => return Ok(issued),
                    OrderStatus::Invalid(reason) => {
                        return Err(CertError::ChallengeFailed {
                            domain: request.domain.clone(),
                            reason,
                        })
                    }
                }
            }
        };

        tokio::time::timeout(self.config.challenge_timeout, poll)
            .await
            .map_err(|_| CertError::ChallengeFailed {
                domain: request.domain.clone(),
                reason: format!(
                    "validation not completed within {:?}",
                    self.config.challenge_timeout
                ),
            })?
    }

    async fn persist(&self, cert: &Certificate) -> Result<()> {
        let Some(dir) = &self.config.storage_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let (cert_path, key_path) = paths(dir, &cert.domain);
        tokio::fs::write(cert_path, &cert.chain_pem).await?;
        tokio::fs::write(key_path, &cert.key_pem).await?;
        debug!(domain = %cert.domain, dir = %dir.display(), "Certificate persisted");
        Ok(())
    }

    fn fresh(&self, domain: &str) -> Option<Arc<Certificate>> {
        self.store
            .get(domain)
            .filter(|c| !c.needs_renewal_at(Utc::now(), self.config.renew_before))
    }

    fn emit(&self, event: KeelEvent) {
        let _ = self
            .event_tx
            .send(EventEnvelope::new(event, EventSource::Certificates));
    }
}

fn paths(dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}{}", domain, CERT_SUFFIX)),
        dir.join(format!("{}{}", domain, KEY_SUFFIX)),
    )
}

/// Lowercase `domain` and reject names HTTP-01 cannot validate
fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if domain.len() > 253 || !domain.contains('.') || !domain.split('.').all(valid_label) {
        return Err(CertError::UnsupportedDomain(domain));
    }
    Ok(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::LocalAuthority;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Counts orders and optionally never completes them
    struct ScriptedIssuer {
        inner: LocalAuthority,
        orders: AtomicU32,
        stall: bool,
    }

    #[async_trait]
    impl Issuer for ScriptedIssuer {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn account_thumbprint(&self) -> &str {
            self.inner.account_thumbprint()
        }

        async fn request(&self, request: &IssuanceRequest) -> Result<String> {
            self.orders.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.request(request).await
        }

        async fn poll(&self, order: &str) -> Result<OrderStatus> {
            if self.stall {
                return Ok(OrderStatus::Pending);
            }
            self.inner.poll(order).await
        }
    }

    fn manager(config: CertConfig, stall: bool) -> (Arc<CertificateManager>, Arc<ScriptedIssuer>) {
        let responder = Arc::new(ChallengeResponder::new());
        let issuer = Arc::new(ScriptedIssuer {
            inner: LocalAuthority::new("keel-local-ca", responder.clone()).unwrap(),
            orders: AtomicU32::new(0),
            stall,
        });
        let manager = Arc::new(CertificateManager::new(
            config,
            Arc::new(CertStore::new()),
            responder,
            issuer.clone(),
        ));
        (manager, issuer)
    }

    #[tokio::test]
    async fn test_ensure_issues_once() {
        let (manager, issuer) = manager(CertConfig::default(), false);
        let mut events = manager.subscribe();

        let cert = manager.ensure("Kibana-Labs.example.com").await.unwrap();
        assert_eq!(cert.domain, "kibana-labs.example.com");
        assert!(cert.is_valid());

        let again = manager.ensure("kibana-labs.example.com").await.unwrap();
        assert_eq!(again.fingerprint, cert.fingerprint);
        assert_eq!(issuer.orders.load(Ordering::SeqCst), 1);
        assert_eq!(manager.responder().pending(), 0);
        assert!(matches!(
            events.recv().await.unwrap().event,
            KeelEvent::CertificateIssued { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_is_coalesced() {
        let (manager, issuer) = manager(CertConfig::default(), false);
        let (a, b) = tokio::join!(
            manager.ensure("kibana-labs.example.com"),
            manager.ensure("kibana-labs.example.com")
        );
        assert_eq!(a.unwrap().fingerprint, b.unwrap().fingerprint);
        assert_eq!(issuer.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_validation_times_out() {
        let config = CertConfig {
            challenge_timeout: Duration::from_secs(30),
            ..CertConfig::default()
        };
        let (manager, _) = manager(config, true);
        let mut events = manager.subscribe();

        let err = manager.ensure("kibana-labs.example.com").await.unwrap_err();
        assert!(matches!(
            err,
            CertError::ChallengeFailed { ref domain, ref reason }
                if domain == "kibana-labs.example.com" && reason.contains("not completed within 30s")
        ));
        assert_eq!(manager.responder().pending(), 0);
        assert!(manager.store().get("kibana-labs.example.com").is_none());
        assert!(matches!(
            events.recv().await.unwrap().event,
            KeelEvent::ChallengeFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_keeps_serving_old_certificate() {
        let (manager, _) = manager(CertConfig::default(), true);
        let responder = Arc::new(ChallengeResponder::new());
        let authority = LocalAuthority::new("old-ca", responder)
            .unwrap()
            .with_validity(Duration::from_secs(10 * 24 * 3600));
        let issued = authority.sign("kibana-labs.example.com").unwrap();
        let old = parse_certificate(
            "kibana-labs.example.com",
            &issued.chain_pem,
            &issued.key_pem,
            ChallengeType::Http01,
        )
        .unwrap();
        manager.store().install(old.clone());

        assert!(manager.ensure("kibana-labs.example.com").await.is_err());
        let served = manager.store().snapshot();
        assert_eq!(served.valid("kibana-labs.example.com").unwrap().fingerprint, old.fingerprint);
    }

    #[tokio::test]
    async fn test_renew_due_replaces_expiring_certificate() {
        let (manager, _) = manager(CertConfig::default(), false);
        let responder = Arc::new(ChallengeResponder::new());
        let short = LocalAuthority::new("old-ca", responder)
            .unwrap()
            .with_validity(Duration::from_secs(5 * 24 * 3600));
        let issued = short.sign("kibana-labs.example.com").unwrap();
        let old = parse_certificate("kibana-labs.example.com", &issued.chain_pem, &issued.key_pem, ChallengeType::Http01)
            .unwrap();
        manager.store().install(old);
        manager.managed.insert("kibana-labs.example.com".into(), ());

        let renewed = manager.renew_due().await;
        assert_eq!(renewed, vec!["kibana-labs.example.com".to_string()]);
        let cert = manager.store().get("kibana-labs.example.com").unwrap();
        assert!(cert.remaining_at(Utc::now()) > Duration::from_secs(60 * 24 * 3600));

        assert!(manager.renew_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = CertConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..CertConfig::default()
        };
        let (manager, _) = manager(config.clone(), false);
        let cert = manager.ensure("kibana-labs.example.com").await.unwrap();
        assert!(dir.path().join("kibana-labs.example.com.crt.pem").exists());

        let (reloaded, issuer) = self::manager(config, false);
        assert_eq!(reloaded.load_from_dir().await.unwrap(), 1);
        assert_eq!(
            reloaded.store().get("kibana-labs.example.com").unwrap().fingerprint,
            cert.fingerprint
        );
        assert_eq!(reloaded.managed(), vec!["kibana-labs.example.com".to_string()]);
        reloaded.ensure("kibana-labs.example.com").await.unwrap();
        assert_eq!(issuer.orders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Kibana.Example.com.").unwrap(), "kibana.example.com");
        assert!(normalize_domain("*.example.com").is_err());
        assert!(normalize_domain("localhost").is_err());
        assert!(normalize_domain("bad_name.example.com").is_err());
        assert!(normalize_domain("-a.example.com").is_err());
    }
}
