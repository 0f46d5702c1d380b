//! Edge route rules
//!
//! Rules are declared on a service directly or derived from its `edge.*`
//! labels. The edge router turns them into its routing table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transport a route is served over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    /// TLS-terminated; requires a valid certificate for the host
    Https,
}

/// Which listeners a route is visible on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkScope {
    #[default]
    Public,
    /// Reachable on the internal network only; never exposed at the edge
    Internal,
}

/// Host-match rule exposing a service through the edge router
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteRule {
    /// Exact host (`kibana.example.com`) or wildcard (`*.example.com`)
    pub host: String,

    #[serde(default = "default_path")]
    pub path_prefix: String,

    /// Target service name
    pub service: String,

    /// Target port on each replica
    pub port: u16,

    #[serde(default)]
    pub transport: Transport,

    /// Redirect plaintext requests to HTTPS instead of proxying them
    #[serde(default)]
    pub force_https: bool,

    #[serde(default)]
    pub scope: NetworkScope,
}

fn default_path() -> String {
    "/".to_string()
}

impl RouteRule {
    pub fn new(host: impl Into<String>, service: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            path_prefix: default_path(),
            service: service.into(),
            port,
            transport: Transport::Http,
            force_https: false,
            scope: NetworkScope::Public,
        }
    }

    /// Serve over TLS and redirect plaintext requests
    pub fn https(mut self) -> Self {
        self.transport = Transport::Https;
        self.force_https = true;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn internal(mut self) -> Self {
        self.scope = NetworkScope::Internal;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.host.starts_with("*.")
    }

    pub fn requires_tls(&self) -> bool {
        self.transport == Transport::Https
    }

    /// Whether the rule's host pattern matches a request host
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match self.host.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .and_then(|rest| rest.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty()),
            None => self.host == host,
        }
    }

    /// Whether the rule's path prefix matches a request path
    pub fn matches_path(&self, path: &str) -> bool {
        if self.path_prefix == "/" {
            return true;
        }
        let prefix = self.path_prefix.trim_end_matches('/');
        path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("route host must not be empty".into());
        }
        let stars = self.host.matches('*').count();
        if stars > 1 || (stars == 1 && !self.is_wildcard()) {
            return Err(format!(
                "route host '{}' may only use a leading '*.' wildcard",
                self.host
            ));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(format!(
                "route path '{}' must start with '/'",
                self.path_prefix
            ));
        }
        if self.port == 0 {
            return Err(format!("route for '{}' has port 0", self.host));
        }
        if self.force_https && self.transport != Transport::Https {
            return Err(format!(
                "route for '{}' forces https but is not served over tls",
                self.host
            ));
        }
        Ok(())
    }

    /// Derive rules from `edge.*` labels.
    ///
    /// `edge.enable` must be `true`; `edge.host` may list several hosts
    /// separated by commas. Returns an empty list when routing is disabled.
    pub fn from_labels(
        service: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<RouteRule>, String> {
        let flag = |key: &str| labels.get(key).is_some_and(|v| is_truthy(v));

        if !flag("edge.enable") {
            return Ok(Vec::new());
        }

        let hosts = labels
            .get("edge.host")
            .ok_or_else(|| "edge.enable is set but edge.host is missing".to_string())?;
        let raw_port = labels
            .get("edge.port")
            .ok_or_else(|| "edge.enable is set but edge.port is missing".to_string())?;
        let port: u16 = raw_port
            .trim()
            .parse()
            .map_err(|_| format!("edge.port '{}' is not a valid port", raw_port))?;

        let tls = flag("edge.tls");
        let redirect = flag("edge.redirect_https");
        let path = labels
            .get("edge.path")
            .cloned()
            .unwrap_or_else(default_path);
        let scope = match labels.get("edge.network").map(String::as_str) {
            Some("internal") => NetworkScope::Internal,
            _ => NetworkScope::Public,
        };

        let rules = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|host| RouteRule {
                host: host.to_ascii_lowercase(),
                path_prefix: path.clone(),
                service: service.to_string(),
                port,
                transport: if tls { Transport::Https } else { Transport::Http },
                force_https: tls && redirect,
                scope,
            })
            .collect::<Vec<_>>();

        if rules.is_empty() {
            return Err("edge.host does not name any host".into());
        }
        Ok(rules)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_wildcard_matching() {
        let rule = RouteRule::new("*.example.com", "web", 80);
        assert!(rule.matches_host("a.example.com"));
        assert!(rule.matches_host("A.B.example.com"));
        assert!(!rule.matches_host("example.com"));
        assert!(!rule.matches_host("aexample.com"));

        let exact = RouteRule::new("Kibana.example.com", "kibana", 5601);
        assert!(exact.matches_host("kibana.EXAMPLE.com"));
    }

    #[test]
    fn test_path_prefix_matching() {
        let rule = RouteRule::new("h", "svc", 80).with_path_prefix("/api/");
        assert!(rule.matches_path("/api"));
        assert!(rule.matches_path("/api/v1"));
        assert!(!rule.matches_path("/apix"));
        assert!(RouteRule::new("h", "svc", 80).matches_path("/anything"));
    }

    #[test]
    fn test_from_labels() {
        let rules = RouteRule::from_labels(
            "kibana",
            &labels(&[
                ("edge.enable", "true"),
                ("edge.host", "kibana-labs.example.com, kibana.internal"),
                ("edge.port", "5601"),
                ("edge.tls", "true"),
                ("edge.redirect_https", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.force_https && r.requires_tls()));
        assert_eq!(rules[1].host, "kibana.internal");
    }

    #[test]
    fn test_from_labels_disabled_or_incomplete() {
        assert!(RouteRule::from_labels("x", &labels(&[("edge.host", "a")]))
            .unwrap()
            .is_empty());
        assert!(RouteRule::from_labels("x", &labels(&[("edge.enable", "true")])).is_err());
        assert!(RouteRule::from_labels(
            "x",
            &labels(&[("edge.enable", "true"), ("edge.host", "a"), ("edge.port", "http")])
        )
        .is_err());
    }

    #[test]
    fn test_validate() {
        assert!(RouteRule::new("a.example.com", "svc", 80).https().validate().is_ok());
        assert!(RouteRule::new("a.*.com", "svc", 80).validate().is_err());
        let mut rule = RouteRule::new("a.example.com", "svc", 80);
        rule.force_https = true;
        assert!(rule.validate().is_err());
    }
}
