//! PEM parsing and certificate inspection

use crate::error::{CertError, Result};
use chrono::{DateTime, TimeZone, Utc};
use keel_types::{Certificate, ChallengeType};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::prelude::*;

/// Build a [`Certificate`] from PEM material, checking that the leaf names
/// `domain` and that the key parses.
pub fn parse_certificate(
    domain: &str,
    chain_pem: &str,
    key_pem: &str,
    challenge: ChallengeType,
) -> Result<Certificate> {
    let invalid = |reason: String| CertError::InvalidCertificate {
        domain: domain.to_string(),
        reason,
    };

    let leaf = CertificateDer::pem_slice_iter(chain_pem.as_bytes())
        .next()
        .ok_or_else(|| invalid("no certificate in chain".into()))?
        .map_err(|e| invalid(format!("bad certificate PEM: {}", e)))?;
    PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| invalid(format!("bad private key PEM: {}", e)))?;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| invalid(format!("failed to parse certificate: {}", e)))?;

    let names = dns_names(&cert);
    if !names.iter().any(|name| name_matches(name, domain)) {
        return Err(invalid(format!("certificate names {:?}", names)));
    }

    let validity = cert.validity();
    Ok(Certificate {
        domain: domain.to_ascii_lowercase(),
        key_pem: key_pem.to_string(),
        chain_pem: chain_pem.to_string(),
        not_before: timestamp(validity.not_before.timestamp()).map_err(invalid)?,
        not_after: timestamp(validity.not_after.timestamp()).map_err(invalid)?,
        challenge,
        issuer: cert.issuer().to_string(),
        fingerprint: blake3::hash(leaf.as_ref()).to_hex().to_string(),
    })
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_ascii_lowercase),
        );
    }
    names
}

fn name_matches(name: &str, domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    match name.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => name == domain,
    }
}

fn timestamp(secs: i64) -> std::result::Result<DateTime<Utc>, String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("timestamp {} out of range", secs))
}
