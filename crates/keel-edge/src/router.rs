//! Edge router state
//!
//! Holds the current route rules and the routing table derived from them.
//! The table is rebuilt whenever the rules, the replica snapshot or the
//! certificate store change, and swapped in atomically; requests in flight
//! keep the table they started with.

use crate::error::{EdgeError, Result};
use crate::table::{RouteDecision, RouteRequest, RouteSummary, RouteTable};
use arc_swap::ArcSwap;
use keel_certs::{ChallengeResponder, CertStore, CHALLENGE_PATH_PREFIX};
use keel_placement::ReplicaSnapshot;
use keel_types::{EventEnvelope, EventSource, KeelEvent, RouteRule};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Routing state shared by the listeners
pub struct EdgeRouter {
    replicas: watch::Receiver<Arc<ReplicaSnapshot>>,
    certs: Arc<CertStore>,
    responder: Arc<ChallengeResponder>,
    rules: ArcSwap<Vec<RouteRule>>,
    table: ArcSwap<RouteTable>,
    generation: AtomicU64,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl EdgeRouter {
    pub fn new(
        replicas: watch::Receiver<Arc<ReplicaSnapshot>>,
        certs: Arc<CertStore>,
        responder: Arc<ChallengeResponder>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(4096);
        Self {
            replicas,
            certs,
            responder,
            rules: ArcSwap::from_pointee(Vec::new()),
            table: ArcSwap::from_pointee(RouteTable::default()),
            generation: AtomicU64::new(0),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Replace the rule set and rebuild the table.
    ///
    /// Rejects invalid rules and two rules claiming the same host and path
    /// for different services. Nothing changes on error.
    #[instrument(skip(self, rules), fields(rules = rules.len()))]
    pub fn set_rules(&self, mut rules: Vec<RouteRule>) -> Result<()> {
        for rule in &rules {
            rule.validate().map_err(EdgeError::InvalidRule)?;
        }
        rules.sort_by(|a, b| {
            (&a.host, &a.path_prefix, &a.service).cmp(&(&b.host, &b.path_prefix, &b.service))
        });
        rules.dedup();

        let mut claimed = BTreeSet::new();
        for rule in &rules {
            if !claimed.insert((rule.host.as_str(), rule.path_prefix.as_str())) {
                return Err(EdgeError::InvalidRule(format!(
                    "{}{} is claimed by more than one rule",
                    rule.host, rule.path_prefix
                )));
            }
        }

        if **self.rules.load() == rules {
            debug!("Route rules unchanged");
            return Ok(());
        }
        self.rules.store(Arc::new(rules));
        self.rebuild();
        Ok(())
    }

    pub fn rules(&self) -> Arc<Vec<RouteRule>> {
        self.rules.load_full()
    }

    /// Rebuild the table from the current inputs. Returns the new generation.
    pub fn rebuild(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let replicas = Arc::clone(&self.replicas.borrow());
        let table = Arc::new(RouteTable::build(
            generation,
            &self.rules.load(),
            &replicas,
            &self.certs.snapshot(),
        ));
        let hosts = table.hosts();

        // A slower concurrent rebuild must not replace a newer table
        self.table.rcu(|current| {
            if current.generation() > generation {
                Arc::clone(current)
            } else {
                Arc::clone(&table)
            }
        });

        debug!(generation, hosts, "Route table rebuilt");
        let _ = self.event_tx.send(EventEnvelope::new(
            KeelEvent::RouteTableRebuilt { generation, hosts },
            EventSource::Edge,
        ));
        generation
    }

    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Decide how to answer one request.
    ///
    /// Domain-validation challenges are answered on plaintext before any
    /// route matching, so a host can be validated before its rule exists.
    pub fn decide(&self, host: &str, path: &str, secure: bool) -> RouteDecision {
        let request = RouteRequest::new(host, path, secure);
        if !secure && request.path.starts_with(CHALLENGE_PATH_PREFIX) {
            if let Some(key_authorization) = self.responder.respond_to_path(&request.host, &request.path) {
                return RouteDecision::Challenge { key_authorization };
            }
        }
        self.table.load().route(&request)
    }

    pub fn routes(&self) -> Vec<RouteSummary> {
        self.table.load().summary()
    }

    /// Exact TLS hosts in the current rules; the domains needing certificates
    pub fn tls_hosts(&self) -> Vec<String> {
        self.table.load().tls_hosts()
    }

    /// Rebuild on every replica or certificate change until shutdown
    pub fn spawn_rebuild_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut replicas = self.replicas.clone();
        let mut certs = self.certs.subscribe();
        tokio::spawn(async move {
            info!("Edge route rebuild loop started");
            self.rebuild();
            loop {
                tokio::select! {
                    changed = replicas.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        self.rebuild();
                    }
                    changed = certs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        self.rebuild();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Edge route rebuild loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_certs::{parse_certificate, LocalAuthority};
    use keel_types::{ChallengeType, HostId, ReplicaInstance, ReplicaState};
    use std::time::Duration;

    fn snapshot(generation: u64, healthy: &[&str]) -> Arc<ReplicaSnapshot> {
        let replicas = healthy
            .iter()
            .enumerate()
            .map(|(i, address)| {
                let mut r = ReplicaInstance::new("kibana", 1, i as u32, HostId::new(*address), 0);
                r.address = Some(address.to_string());
                r.state = ReplicaState::Healthy;
                r
            })
            .collect();
        Arc::new(ReplicaSnapshot { generation, replicas })
    }

    struct Fixture {
        router: Arc<EdgeRouter>,
        replicas: watch::Sender<Arc<ReplicaSnapshot>>,
        certs: Arc<CertStore>,
        responder: Arc<ChallengeResponder>,
    }

    fn fixture() -> Fixture {
        let (replicas, rx) = watch::channel(snapshot(1, &["10.0.0.1"]));
        let certs = Arc::new(CertStore::new());
        let responder = Arc::new(ChallengeResponder::new());
        let router = Arc::new(EdgeRouter::new(rx, certs.clone(), responder.clone()));
        Fixture {
            router,
            replicas,
            certs,
            responder,
        }
    }

    #[test]
    fn test_rejects_conflicting_rules() {
        let f = fixture();
        let result = f.router.set_rules(vec![
            RouteRule::new("kibana.example.com", "kibana", 5601),
            RouteRule::new("kibana.example.com", "grafana", 3000),
        ]);
        assert!(matches!(result, Err(EdgeError::InvalidRule(_))));
        assert!(f.router.rules().is_empty());
    }

    #[test]
    fn test_identical_rules_do_not_rebuild() {
        let f = fixture();
        let rules = vec![RouteRule::new("kibana.example.com", "kibana", 5601)];
        f.router.set_rules(rules.clone()).unwrap();
        let generation = f.router.table().generation();
        f.router.set_rules(rules).unwrap();
        assert_eq!(f.router.table().generation(), generation);
    }

    #[test]
    fn test_challenge_answered_before_routing() {
        let f = fixture();
        f.responder.publish("new.example.com", "tok", "tok.thumb");
        assert_eq!(
            f.router.decide("new.example.com", "/.well-known/acme-challenge/tok", false),
            RouteDecision::Challenge {
                key_authorization: "tok.thumb".into()
            }
        );
        assert_eq!(
            f.router.decide("new.example.com", "/.well-known/acme-challenge/tok", true),
            RouteDecision::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuilds_on_replica_and_certificate_changes() {
        let f = fixture();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = f.router.clone().spawn_rebuild_loop(shutdown_rx);
        f.router
            .set_rules(vec![RouteRule::new("kibana-labs.example.com", "kibana", 5601).https()])
            .unwrap();

        assert!(matches!(
            f.router.decide("kibana-labs.example.com", "/", true),
            RouteDecision::Refused { .. }
        ));

        let authority = LocalAuthority::new("test-ca", f.responder.clone()).unwrap();
        let issued = authority.sign("kibana-labs.example.com").unwrap();
        f.certs.install(
            parse_certificate("kibana-labs.example.com", &issued.chain_pem, &issued.key_pem, ChallengeType::Http01)
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            f.router.decide("kibana-labs.example.com", "/", true),
            RouteDecision::Proxy {
                service: "kibana".into(),
                endpoint: "10.0.0.1:5601".into()
            }
        );

        f.replicas.send_replace(snapshot(2, &[]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            f.router.decide("kibana-labs.example.com", "/", true),
            RouteDecision::ServiceUnavailable {
                service: "kibana".into()
            }
        );

        shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[test]
    fn test_rebuild_emits_event() {
        let f = fixture();
        let mut events = f.router.subscribe();
        let generation = f.router.rebuild();
        let envelope = events.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            KeelEvent::RouteTableRebuilt { generation: g, .. } if g == generation
        ));
        assert_eq!(envelope.source, EventSource::Edge);
    }
}
