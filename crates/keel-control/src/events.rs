//! Event aggregation from all Keel subsystems
//!
//! The EventAggregator forwards the placement, rollout, certificate and edge
//! event streams into one broadcast stream and keeps the most recent events
//! in a bounded log for the operator API.

use keel_types::{EventEnvelope, EventSeverity, EventSource, KeelEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Channel capacity for the unified event stream
const EVENT_CHANNEL_CAPACITY: usize = 16384;

/// Default number of events retained in the log
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1000;

/// Filter for reading the event log
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events at or above this severity
    pub min_severity: Option<EventSeverity>,
    pub source: Option<EventSource>,
    /// Only events concerning this service or domain
    pub subject: Option<String>,
    /// Newest first, at most this many
    pub limit: Option<usize>,
}

impl EventQuery {
    fn matches(&self, envelope: &EventEnvelope) -> bool {
        self.min_severity.map_or(true, |min| envelope.severity >= min)
            && self.source.map_or(true, |source| envelope.source == source)
            && self
                .subject
                .as_deref()
                .map_or(true, |subject| event_subject(&envelope.event) == Some(subject))
    }
}

/// Service or domain an event is about
pub fn event_subject(event: &KeelEvent) -> Option<&str> {
    match event {
        KeelEvent::SpecSubmitted { service, .. }
        | KeelEvent::SpecUnchanged { service, .. }
        | KeelEvent::ServiceRemoved { service }
        | KeelEvent::ReplicaPlaced { service, .. }
        | KeelEvent::ReplicaStopped { service, .. }
        | KeelEvent::Unschedulable { service, .. }
        | KeelEvent::ReplicaHealthChanged { service, .. }
        | KeelEvent::ReplicaRestarted { service, .. }
        | KeelEvent::RolloutStarted { service, .. }
        | KeelEvent::BatchCompleted { service, .. }
        | KeelEvent::RolloutCompleted { service, .. }
        | KeelEvent::RolloutFailed { service, .. }
        | KeelEvent::RolloutPaused { service, .. }
        | KeelEvent::RolloutResumed { service }
        | KeelEvent::RolloutRolledBack { service, .. }
        | KeelEvent::RolloutPreempted { service, .. }
        | KeelEvent::QuorumViolation { service, .. } => Some(service),
        KeelEvent::CertificateIssued { domain, .. }
        | KeelEvent::CertificateRenewalScheduled { domain, .. }
        | KeelEvent::ChallengeFailed { domain, .. } => Some(domain),
        KeelEvent::RouteTableRebuilt { .. } => None,
    }
}

/// Aggregates events from all Keel subsystems into a single stream
#[derive(Clone)]
pub struct EventAggregator {
    unified_tx: broadcast::Sender<EventEnvelope>,
    log: Arc<RwLock<VecDeque<EventEnvelope>>>,
    capacity: usize,
}

impl EventAggregator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    /// Keep at most `capacity` events in the log
    pub fn with_capacity(capacity: usize) -> Self {
        let (unified_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            unified_tx,
            log: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.unified_tx.subscribe()
    }

    /// Record and broadcast one event
    pub async fn publish(&self, envelope: EventEnvelope) {
        {
            let mut log = self.log.write().await;
            if log.len() == self.capacity {
                log.pop_front();
            }
            log.push_back(envelope.clone());
        }
        let _ = self.unified_tx.send(envelope);
    }

    /// Emit a control plane event
    pub async fn emit(&self, event: KeelEvent) {
        self.publish(EventEnvelope::new(event, EventSource::ControlPlane))
            .await;
    }

    /// Recent events, newest first
    pub async fn recent(&self, query: &EventQuery) -> Vec<EventEnvelope> {
        let log = self.log.read().await;
        log.iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    /// Forward events from a subsystem receiver until its channel closes
    pub async fn forward_from(
        &self,
        mut source_rx: broadcast::Receiver<EventEnvelope>,
        source_name: &'static str,
    ) {
        loop {
            match source_rx.recv().await {
                Ok(event) => {
                    debug!(source = source_name, event_id = %event.id, "Forwarding event");
                    self.publish(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(source = source_name, lagged = n, "Event aggregator lagged behind source");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(source = source_name, "Source channel closed");
                    break;
                }
            }
        }
    }

    /// Spawn a forwarding task for `source_rx`
    pub fn spawn_forwarder(
        &self,
        source_rx: broadcast::Receiver<EventEnvelope>,
        source_name: &'static str,
    ) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            aggregator.forward_from(source_rx, source_name).await;
        })
    }
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_log_is_bounded() {
        let aggregator = EventAggregator::with_capacity(3);
        for version in 1..=5 {
            aggregator
                .emit(KeelEvent::SpecSubmitted {
                    service: "es".into(),
                    version,
                })
                .await;
        }
        let recent = aggregator.recent(&EventQuery::default()).await;
        let versions: Vec<u64> = recent
            .iter()
            .map(|e| match e.event {
                KeelEvent::SpecSubmitted { version, .. } => version,
                _ => 0,
            })
            .collect();
        assert_eq!(versions, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let aggregator = EventAggregator::new();
        aggregator
            .emit(KeelEvent::SpecSubmitted {
                service: "es".into(),
                version: 1,
            })
            .await;
        aggregator
            .emit(KeelEvent::ChallengeFailed {
                domain: "a.example.com".into(),
                reason: "timeout".into(),
            })
            .await;

        let critical = aggregator
            .recent(&EventQuery {
                min_severity: Some(EventSeverity::Critical),
                ..Default::default()
            })
            .await;
        assert_eq!(critical.len(), 1);

        let for_es = aggregator
            .recent(&EventQuery {
                subject: Some("es".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(for_es.len(), 1);
        assert!(matches!(for_es[0].event, KeelEvent::SpecSubmitted { .. }));
    }

    #[tokio::test]
    async fn test_forwards_subsystem_events() {
        let aggregator = EventAggregator::new();
        let mut unified = aggregator.subscribe();
        let (tx, rx) = broadcast::channel(16);
        let handle = aggregator.spawn_forwarder(rx, "edge");

        tx.send(EventEnvelope::new(
            KeelEvent::RouteTableRebuilt {
                generation: 1,
                hosts: 0,
            },
            EventSource::Edge,
        ))
        .unwrap();
        let received = timeout(Duration::from_millis(100), unified.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.source, EventSource::Edge);

        drop(tx);
        handle.await.unwrap();
        assert_eq!(aggregator.len().await, 1);
    }
}
