//! HTTP-01 challenge responder
//!
//! Tokens are published while a validation is in flight and answered by the
//! plaintext edge listener at `/.well-known/acme-challenge/<token>`.

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

/// Path prefix answered by the responder
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const TOKEN_LEN: usize = 43;

/// Published challenge tokens
#[derive(Debug, Default)]
pub struct ChallengeResponder {
    tokens: DashMap<String, Published>,
}

#[derive(Debug, Clone)]
struct Published {
    domain: String,
    key_authorization: String,
}

impl ChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, domain: &str, token: &str, key_authorization: &str) {
        debug!(%domain, %token, "Challenge token published");
        self.tokens.insert(
            token.to_string(),
            Published {
                domain: domain.to_ascii_lowercase(),
                key_authorization: key_authorization.to_string(),
            },
        );
    }

    pub fn withdraw(&self, token: &str) {
        if self.tokens.remove(token).is_some() {
            debug!(%token, "Challenge token withdrawn");
        }
    }

    /// Key authorization for `token`
    pub fn respond(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|p| p.key_authorization.clone())
    }

    /// Key authorization for a request path, if the request targets `host`
    /// and names a published token
    pub fn respond_to_path(&self, host: &str, path: &str) -> Option<String> {
        let token = token_from_path(path)?;
        let published = self.tokens.get(token)?;
        if !published.domain.eq_ignore_ascii_case(host) {
            return None;
        }
        Some(published.key_authorization.clone())
    }

    pub fn pending(&self) -> usize {
        self.tokens.len()
    }
}

/// Token part of a challenge path
pub fn token_from_path(path: &str) -> Option<&str> {
    path.strip_prefix(CHALLENGE_PATH_PREFIX)
        .filter(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
}

/// Random URL-safe token
pub fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// `token.thumbprint` key authorization
pub fn key_authorization(token: &str, account_thumbprint: &str) -> String {
    format!("{}.{}", token, account_thumbprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_respond_withdraw() {
        let responder = ChallengeResponder::new();
        let token = new_token();
        assert_eq!(token.len(), TOKEN_LEN);

        let auth = key_authorization(&token, "thumb");
        responder.publish("kibana-labs.example.com", &token, &auth);

        let path = format!("{}{}", CHALLENGE_PATH_PREFIX, token);
        assert_eq!(responder.respond_to_path("kibana-labs.example.com", &path), Some(auth));
        assert_eq!(responder.respond_to_path("other.example.com", &path), None);

        responder.withdraw(&token);
        assert_eq!(responder.respond(&token), None);
        assert_eq!(responder.pending(), 0);
    }

    #[test]
    fn test_token_from_path() {
        assert_eq!(token_from_path("/.well-known/acme-challenge/abc_1-2"), Some("abc_1-2"));
        assert_eq!(token_from_path("/.well-known/acme-challenge/"), None);
        assert_eq!(token_from_path("/.well-known/acme-challenge/../etc"), None);
        assert_eq!(token_from_path("/index.html"), None);
    }
}
