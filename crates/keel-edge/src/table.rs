//! Routing table
//!
//! A table is a pure function of the route rules, the replica snapshot and
//! the certificate snapshot. It is never mutated after build except for the
//! round-robin cursors.

use chrono::{DateTime, Utc};
use keel_certs::CertSnapshot;
use keel_placement::ReplicaSnapshot;
use keel_types::{NetworkScope, ReplicaId, RouteRule};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One healthy replica endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub replica: ReplicaId,
    /// `address:port`
    pub endpoint: String,
}

/// A rule with its resolved backends
#[derive(Debug)]
pub struct RouteEntry {
    pub rule: RouteRule,
    pub backends: Vec<Backend>,
    /// Expiry of the certificate for the rule's host, if one is installed
    pub cert_not_after: Option<DateTime<Utc>>,
    cert_not_before: Option<DateTime<Utc>>,
    cursor: AtomicUsize,
}

impl RouteEntry {
    fn tls_ready_at(&self, now: DateTime<Utc>) -> bool {
        match (self.cert_not_before, self.cert_not_after) {
            (Some(from), Some(until)) => from <= now && now < until,
            _ => false,
        }
    }

    /// Round-robin over the healthy set
    fn next_backend(&self) -> Option<&Backend> {
        if self.backends.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        self.backends.get(i)
    }
}

/// Incoming request as seen by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// Host header or SNI, port stripped
    pub host: String,
    /// Path and query
    pub path: String,
    /// Arrived over TLS
    pub secure: bool,
}

impl RouteRequest {
    pub fn new(host: &str, path: &str, secure: bool) -> Self {
        Self {
            host: strip_port(host).to_ascii_lowercase(),
            path: if path.is_empty() { "/".into() } else { path.to_string() },
            secure,
        }
    }

    fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or("/")
    }
}

/// Routing decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// No rule matches the host and path
    NotFound,
    /// Plaintext request for a host that forces HTTPS
    Redirect { location: String },
    /// TLS required but no valid certificate is installed
    Refused { host: String },
    /// Matched, but no healthy backend
    ServiceUnavailable { service: String },
    /// Answer a domain-validation challenge
    Challenge { key_authorization: String },
    Proxy { service: String, endpoint: String },
}

/// Operator view of one table entry
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub host: String,
    pub path_prefix: String,
    pub service: String,
    pub port: u16,
    pub tls: bool,
    pub force_https: bool,
    pub tls_ready: bool,
    pub backends: Vec<String>,
}

/// Immutable routing table
#[derive(Debug, Default)]
pub struct RouteTable {
    generation: u64,
    exact: BTreeMap<String, Vec<RouteEntry>>,
    /// Longest suffix first
    wildcards: Vec<(String, Vec<RouteEntry>)>,
    /// Internal-scope rules left off the public listeners
    internal: usize,
}

impl RouteTable {
    /// Build a table. Rules for the same host are ordered longest path first.
    pub fn build(
        generation: u64,
        rules: &[RouteRule],
        replicas: &ReplicaSnapshot,
        certs: &CertSnapshot,
    ) -> Self {
        let mut exact: BTreeMap<String, Vec<RouteEntry>> = BTreeMap::new();
        let mut wildcards: BTreeMap<String, Vec<RouteEntry>> = BTreeMap::new();
        let mut internal = 0;

        for rule in rules {
            if rule.scope == NetworkScope::Internal {
                internal += 1;
                continue;
            }

            let mut backends: Vec<Backend> = replicas
                .healthy_for(&rule.service)
                .filter_map(|r| {
                    r.address.as_ref().map(|address| Backend {
                        replica: r.id.clone(),
                        endpoint: format!("{}:{}", address, rule.port),
                    })
                })
                .collect();
            backends.sort_by(|a, b| a.endpoint.cmp(&b.endpoint).then_with(|| a.replica.cmp(&b.replica)));

            let cert = certs.get(&rule.host);
            let entry = RouteEntry {
                rule: rule.clone(),
                backends,
                cert_not_before: cert.map(|c| c.not_before),
                cert_not_after: cert.map(|c| c.not_after),
                cursor: AtomicUsize::new(0),
            };

            match rule.host.strip_prefix("*.") {
                Some(suffix) => wildcards.entry(suffix.to_string()).or_default().push(entry),
                None => exact.entry(rule.host.clone()).or_default().push(entry),
            }
        }

        let by_path = |entries: &mut Vec<RouteEntry>| {
            entries.sort_by(|a, b| b.rule.path_prefix.len().cmp(&a.rule.path_prefix.len()));
        };
        exact.values_mut().for_each(by_path);
        let mut wildcards: Vec<(String, Vec<RouteEntry>)> = wildcards.into_iter().collect();
        wildcards.iter_mut().for_each(|(_, entries)| by_path(entries));
        wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            generation,
            exact,
            wildcards,
            internal,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of distinct host patterns
    pub fn hosts(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn internal_rules(&self) -> usize {
        self.internal
    }

    /// Decide how to serve `request`. Never blocks.
    pub fn route(&self, request: &RouteRequest) -> RouteDecision {
        self.route_at(request, Utc::now())
    }

    pub fn route_at(&self, request: &RouteRequest, now: DateTime<Utc>) -> RouteDecision {
        let Some(entry) = self.lookup(&request.host, request.path_only()) else {
            return RouteDecision::NotFound;
        };
        let rule = &entry.rule;

        if !request.secure && rule.force_https {
            return RouteDecision::Redirect {
                location: format!("https://{}{}", request.host, request.path),
            };
        }
        if (request.secure || rule.requires_tls()) && !entry.tls_ready_at(now) {
            return RouteDecision::Refused {
                host: request.host.clone(),
            };
        }

        match entry.next_backend() {
            Some(backend) => RouteDecision::Proxy {
                service: rule.service.clone(),
                endpoint: backend.endpoint.clone(),
            },
            None => RouteDecision::ServiceUnavailable {
                service: rule.service.clone(),
            },
        }
    }

    /// Whether TLS for `host` may be served now
    pub fn tls_ready(&self, host: &str) -> bool {
        let now = Utc::now();
        self.entries_for(&host.to_ascii_lowercase())
            .is_some_and(|entries| entries.iter().any(|e| e.tls_ready_at(now)))
    }

    /// Exact hosts with a TLS rule; the ones that need certificates
    pub fn tls_hosts(&self) -> Vec<String> {
        self.exact
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.rule.requires_tls()))
            .map(|(host, _)| host.clone())
            .collect()
    }

    pub fn summary(&self) -> Vec<RouteSummary> {
        let now = Utc::now();
        self.exact
            .values()
            .chain(self.wildcards.iter().map(|(_, entries)| entries))
            .flatten()
            .map(|entry| RouteSummary {
                host: entry.rule.host.clone(),
                path_prefix: entry.rule.path_prefix.clone(),
                service: entry.rule.service.clone(),
                port: entry.rule.port,
                tls: entry.rule.requires_tls(),
                force_https: entry.rule.force_https,
                tls_ready: entry.tls_ready_at(now),
                backends: entry.backends.iter().map(|b| b.endpoint.clone()).collect(),
            })
            .collect()
    }

    fn entries_for(&self, host: &str) -> Option<&Vec<RouteEntry>> {
        if let Some(entries) = self.exact.get(host) {
            return Some(entries);
        }
        self.wildcards
            .iter()
            .find(|(suffix, _)| {
                host.strip_suffix(suffix.as_str())
                    .and_then(|rest| rest.strip_suffix('.'))
                    .is_some_and(|label| !label.is_empty())
            })
            .map(|(_, entries)| entries)
    }

    fn lookup(&self, host: &str, path: &str) -> Option<&RouteEntry> {
        self.entries_for(host)?
            .iter()
            .find(|entry| entry.rule.matches_path(path))
    }
}

/// Host without a trailing `:port`
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map_or(host, |h| &h[1..]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
