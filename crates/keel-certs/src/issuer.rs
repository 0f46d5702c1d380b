//! Certificate authority clients
//!
//! [`Issuer`] is the seam to a certificate authority: an order is requested
//! with the published challenge, then polled until it is valid or invalid.
//! [`LocalAuthority`] is an in-process CA that validates against the local
//! challenge responder.

use crate::challenge::{ChallengeResponder, CHALLENGE_PATH_PREFIX};
use crate::error::{CertError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PublicKeyData,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default lifetime of certificates signed by the local authority
pub const LOCAL_CERT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// One issuance request with its published challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    pub domain: String,
    pub token: String,
    pub key_authorization: String,
}

/// Issued chain and private key, PEM encoded
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// State of an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    /// Validation not finished yet
    Pending,
    Valid(IssuedCertificate),
    /// Validation failed; the order is dead
    Invalid(String),
}

/// Certificate authority client
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Issuer name recorded on issued certificates
    fn name(&self) -> &str;

    /// Account key thumbprint used to build key authorizations
    fn account_thumbprint(&self) -> &str;

    /// Open an order for `request.domain`. Returns the order id.
    async fn request(&self, request: &IssuanceRequest) -> Result<String>;

    async fn poll(&self, order: &str) -> Result<OrderStatus>;
}

/// In-process certificate authority
pub struct LocalAuthority {
    name: String,
    ca_cert_pem: String,
    ca_key_pem: String,
    thumbprint: String,
    responder: Arc<ChallengeResponder>,
    validity: Duration,
    orders: DashMap<String, IssuanceRequest>,
    next_order: AtomicU64,
}

impl LocalAuthority {
    /// Create a CA with a fresh self-signed root
    pub fn new(name: impl Into<String>, responder: Arc<ChallengeResponder>) -> Result<Self> {
        let name = name.into();
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = validity_window(CA_VALIDITY);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate().map_err(|e| issuer_error("failed to generate CA key", e))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| issuer_error("failed to create CA certificate", e))?;

        info!(issuer = %name, "Local certificate authority created");
        Ok(Self::assemble(name, cert.pem(), key.serialize_pem(), &key, responder))
    }

    /// Load a CA from its certificate and key
    pub fn from_pem(
        name: impl Into<String>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
        responder: Arc<ChallengeResponder>,
    ) -> Result<Self> {
        let key = KeyPair::from_pem(ca_key_pem).map_err(|e| issuer_error("failed to parse CA key", e))?;
        rcgen::Issuer::from_ca_cert_pem(ca_cert_pem, &key)
            .map_err(|e| issuer_error("failed to parse CA certificate", e))?;
        Ok(Self::assemble(
            name.into(),
            ca_cert_pem.to_string(),
            ca_key_pem.to_string(),
            &key,
            responder,
        ))
    }

    fn assemble(
        name: String,
        ca_cert_pem: String,
        ca_key_pem: String,
        key: &KeyPair,
        responder: Arc<ChallengeResponder>,
    ) -> Self {
        Self {
            name,
            ca_cert_pem,
            ca_key_pem,
            thumbprint: blake3::hash(&key.subject_public_key_info()).to_hex().to_string(),
            responder,
            validity: LOCAL_CERT_VALIDITY,
            orders: DashMap::new(),
            next_order: AtomicU64::new(1),
        }
    }

    /// Lifetime of issued leaf certificates
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Root certificate, for clients that should trust issued certificates
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Sign a leaf certificate for `domain`
    pub fn sign(&self, domain: &str) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| issuer_error("invalid domain name", e))?;
        params.distinguished_name = distinguished_name(domain);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let (not_before, not_after) = validity_window(self.validity);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate().map_err(|e| issuer_error("failed to generate key", e))?;
        let ca_key =
            KeyPair::from_pem(&self.ca_key_pem).map_err(|e| issuer_error("failed to load CA key", e))?;
        let ca = rcgen::Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| issuer_error("failed to load CA certificate", e))?;
        let cert = params
            .signed_by(&key, &ca)
            .map_err(|e| issuer_error("failed to sign certificate", e))?;

        Ok(IssuedCertificate {
            chain_pem: format!("{}{}", cert.pem(), self.ca_cert_pem),
            key_pem: key.serialize_pem(),
        })
    }
}

#[async_trait]
impl Issuer for LocalAuthority {
    fn name(&self) -> &str {
        &self.name
    }

    fn account_thumbprint(&self) -> &str {
        &self.thumbprint
    }

    async fn request(&self, request: &IssuanceRequest) -> Result<String> {
        let order = format!("order-{}", self.next_order.fetch_add(1, Ordering::SeqCst));
        debug!(%order, domain = %request.domain, "Order opened");
        self.orders.insert(order.clone(), request.clone());
        Ok(order)
    }

    async fn poll(&self, order: &str) -> Result<OrderStatus> {
        let (_, request) = self
            .orders
            .remove(order)
            .ok_or_else(|| CertError::Issuer(format!("unknown order {}", order)))?;

        let path = format!("{}{}", CHALLENGE_PATH_PREFIX, request.token);
        match self.responder.respond_to_path(&request.domain, &path) {
            Some(served) if served == request.key_authorization => {
                let issued = self.sign(&request.domain)?;
                info!(domain = %request.domain, "Challenge validated, certificate signed");
                Ok(OrderStatus::Valid(issued))
            }
            Some(_) => {
                warn!(domain = %request.domain, "Key authorization mismatch");
                Ok(OrderStatus::Invalid("key authorization mismatch".into()))
            }
            None => {
                warn!(domain = %request.domain, "Challenge token not served");
                Ok(OrderStatus::Invalid(format!("{} not served for {}", path, request.domain)))
            }
        }
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String("Keel".to_string()));
    dn
}

/// Backdated an hour to absorb clock skew between hosts
fn validity_window(lifetime: Duration) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    let lifetime = time::Duration::try_from(lifetime).unwrap_or(time::Duration::days(90));
    (now - time::Duration::hours(1), now + lifetime)
}

fn issuer_error(context: &str, e: rcgen::Error) -> CertError {
    CertError::Issuer(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{key_authorization, new_token};
    use crate::pem::parse_certificate;
    use keel_types::ChallengeType;

    fn request(authority: &LocalAuthority, domain: &str) -> IssuanceRequest {
        let token = new_token();
        IssuanceRequest {
            domain: domain.into(),
            key_authorization: key_authorization(&token, authority.account_thumbprint()),
            token,
        }
    }

    #[tokio::test]
    async fn test_validates_published_challenge() {
        let responder = Arc::new(ChallengeResponder::new());
        let authority = LocalAuthority::new("keel-local-ca", responder.clone()).unwrap();
        let req = request(&authority, "kibana-labs.example.com");
        responder.publish(&req.domain, &req.token, &req.key_authorization);

        let order = authority.request(&req).await.unwrap();
        let OrderStatus::Valid(issued) = authority.poll(&order).await.unwrap() else {
            panic!("expected a valid order");
        };

        let cert = parse_certificate(&req.domain, &issued.chain_pem, &issued.key_pem, ChallengeType::Http01)
            .unwrap();
        assert!(cert.is_valid());
        assert!(cert.issuer.contains("keel-local-ca"));
        let days = (cert.not_after - cert.not_before).num_days();
        assert_eq!(days, 90);
    }

    #[tokio::test]
    async fn test_unpublished_challenge_is_invalid() {
        let responder = Arc::new(ChallengeResponder::new());
        let authority = LocalAuthority::new("keel-local-ca", responder).unwrap();
        let req = request(&authority, "kibana-labs.example.com");

        let order = authority.request(&req).await.unwrap();
        assert!(matches!(authority.poll(&order).await.unwrap(), OrderStatus::Invalid(_)));
        assert!(authority.poll(&order).await.is_err());
    }

    #[test]
    fn test_reload_from_pem() {
        let responder = Arc::new(ChallengeResponder::new());
        let authority = LocalAuthority::new("keel-local-ca", responder.clone()).unwrap();
        let reloaded = LocalAuthority::from_pem(
            "keel-local-ca",
            authority.ca_cert_pem(),
            authority.ca_key_pem(),
            responder,
        )
        .unwrap();
        assert_eq!(reloaded.account_thumbprint(), authority.account_thumbprint());
        assert_eq!(authority.account_thumbprint().len(), 64);
        assert!(reloaded.sign("a.example.com").is_ok());
    }
}
