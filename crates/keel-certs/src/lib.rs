//! # Keel Certs - Per-domain certificate management
//!
//! The [`CertificateManager`] keeps a valid certificate installed for every
//! managed domain:
//!
//! 1. publish an HTTP-01 token on the [`ChallengeResponder`];
//! 2. order a certificate from the configured [`Issuer`] and poll the order
//!    within `challenge_timeout`;
//! 3. install the result into the [`CertStore`] in one atomic swap and
//!    withdraw the token.
//!
//! A failed issuance leaves the previous certificate in place. The renewal
//! loop re-runs issuance for domains within `renew_before` of expiry.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod challenge;
pub mod config;
pub mod error;
pub mod issuer;
pub mod manager;
pub mod pem;
pub mod store;

pub use challenge::{ChallengeResponder, CHALLENGE_PATH_PREFIX};
pub use config::CertConfig;
pub use error::{CertError, Result};
pub use issuer::{IssuanceRequest, IssuedCertificate, Issuer, LocalAuthority, OrderStatus};
pub use manager::CertificateManager;
pub use pem::parse_certificate;
pub use store::{CertSnapshot, CertStore};
