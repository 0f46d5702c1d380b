//! Rollout Controller - per-service rollout state machine
//!
//! The controller is the entry point for version changes. Each service has at
//! most one rollout task; a submission while one runs preempts it at the next
//! batch boundary.

use crate::batch::validate_plan;
use crate::error::{Result, RolloutError};
use crate::state::{RolloutKind, RolloutOutcome, RolloutRecord, RolloutStateStore};
use dashmap::DashMap;
use keel_health::HealthSupervisor;
use keel_placement::PlacementEngine;
use keel_types::{
    EventEnvelope, EventSource, FailureAction, KeelEvent, RolloutPhase, RolloutStatus, ServiceSpec,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, instrument, warn};

/// Work item for a service's rollout task
#[derive(Debug, Clone)]
pub(crate) enum Job {
    Rollout(Arc<ServiceSpec>),
    Rollback(Arc<ServiceSpec>),
}

impl Job {
    fn spec(&self) -> &Arc<ServiceSpec> {
        match self {
            Job::Rollout(spec) | Job::Rollback(spec) => spec,
        }
    }

    fn kind(&self) -> RolloutKind {
        match self {
            Job::Rollout(_) => RolloutKind::Rollout,
            Job::Rollback(_) => RolloutKind::Rollback,
        }
    }
}

/// Flags checked by a running rollout at batch boundaries
#[derive(Debug, Default)]
pub(crate) struct RolloutControl {
    preempt: AtomicBool,
    pause: AtomicBool,
}

impl RolloutControl {
    pub(crate) fn preempted(&self) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// How a converge pass ended without error
#[derive(Debug)]
pub(crate) enum Converged {
    Completed { failures: Vec<String> },
    Preempted,
    Paused,
}

#[derive(Debug)]
struct ServiceState {
    /// Spec the replica set last converged to
    deployed: Option<Arc<ServiceSpec>>,
    /// Spec deployed before `deployed`
    previous: Option<Arc<ServiceSpec>>,
    /// Most recently requested spec
    target: Option<Arc<ServiceSpec>>,
    running: bool,
    queued: Option<Job>,
    last_job: Option<Job>,
    control: Arc<RolloutControl>,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            deployed: None,
            previous: None,
            target: None,
            running: false,
            queued: None,
            last_job: None,
            control: Arc::new(RolloutControl::default()),
        }
    }
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SubmitDecision {
    /// Same content as the current target; nothing to do
    Unchanged { version: u64 },
    /// Rollout task started
    Started { version: u64 },
    /// Queued behind the running rollout, which will yield after its batch
    Queued { version: u64, preempting: u64 },
}

/// Rollout controller
pub struct RolloutController {
    pub(crate) placement: Arc<PlacementEngine>,
    pub(crate) health: Arc<HealthSupervisor>,
    store: Arc<dyn RolloutStateStore>,
    services: DashMap<String, ServiceState>,
    pub(crate) event_tx: broadcast::Sender<EventEnvelope>,
    revision: watch::Sender<u64>,
}

impl RolloutController {
    pub fn new(
        placement: Arc<PlacementEngine>,
        health: Arc<HealthSupervisor>,
        store: Arc<dyn RolloutStateStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(4096);
        let (revision, _) = watch::channel(0);
        Self {
            placement,
            health,
            store,
            services: DashMap::new(),
            event_tx,
            revision,
        }
    }

    /// Subscribe to rollout events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Submit a registered spec version
    #[instrument(skip(self, spec), fields(service = %spec.name, version = spec.version))]
    pub async fn submit(self: &Arc<Self>, spec: ServiceSpec) -> Result<SubmitDecision> {
        validate_plan(&spec)?;
        let spec = Arc::new(spec);
        let version = spec.version;

        let mut state = self
            .services
            .entry(spec.name.clone())
            .or_insert_with(ServiceState::new);

        if let Some(current) = &state.target {
            if current.fingerprint() == spec.fingerprint() {
                info!("Spec unchanged, no rollout");
                return Ok(SubmitDecision::Unchanged {
                    version: current.version,
                });
            }
        }

        let preempting = state
            .queued
            .as_ref()
            .or(state.last_job.as_ref())
            .map(|j| j.spec().version)
            .unwrap_or_default();
        state.target = Some(Arc::clone(&spec));
        let job = Job::Rollout(Arc::clone(&spec));
        state.last_job = Some(job.clone());

        if state.running {
            state.control.preempt.store(true, Ordering::SeqCst);
            state.queued = Some(job);
            info!(preempting, "Rollout queued behind running rollout");
            return Ok(SubmitDecision::Queued {
                version,
                preempting,
            });
        }

        state.running = true;
        state.control = Arc::new(RolloutControl::default());
        drop(state);

        tokio::spawn(Arc::clone(self).drive(spec.name.clone(), job));
        Ok(SubmitDecision::Started { version })
    }

    pub async fn status(&self, service: &str) -> Result<Option<RolloutStatus>> {
        Ok(self.store.status(service).await?)
    }

    pub async fn list(&self) -> Result<Vec<RolloutStatus>> {
        Ok(self.store.list_statuses().await?)
    }

    pub async fn history(&self, service: &str) -> Result<Vec<RolloutRecord>> {
        Ok(self.store.history(service).await?)
    }

    /// Halt the running rollout after its current batch
    #[instrument(skip(self))]
    pub fn pause(&self, service: &str) -> Result<()> {
        let state = self
            .services
            .get(service)
            .ok_or_else(|| RolloutError::NotFound(service.to_string()))?;
        if !state.running {
            return Err(RolloutError::InvalidState(format!(
                "no rollout in progress for {}",
                service
            )));
        }
        state.control.pause.store(true, Ordering::SeqCst);
        info!("Pause requested");
        Ok(())
    }

    /// Continue a paused rollout from the replicas' current state
    #[instrument(skip(self))]
    pub async fn resume(self: &Arc<Self>, service: &str) -> Result<()> {
        let phase = self.store.status(service).await?.map(|s| s.phase);

        let mut state = self
            .services
            .get_mut(service)
            .ok_or_else(|| RolloutError::NotFound(service.to_string()))?;

        if state.running {
            if state.control.pause.swap(false, Ordering::SeqCst) {
                info!("Pending pause cancelled");
                return Ok(());
            }
            return Err(RolloutError::InvalidState(format!("{} is not paused", service)));
        }
        if !matches!(phase, Some(RolloutPhase::Paused { .. })) {
            return Err(RolloutError::InvalidState(format!("{} is not paused", service)));
        }
        let job = state
            .last_job
            .clone()
            .ok_or_else(|| RolloutError::InvalidState(format!("nothing to resume for {}", service)))?;

        state.running = true;
        state.control = Arc::new(RolloutControl::default());
        drop(state);

        let _ = self.event_tx.send(EventEnvelope::new(
            KeelEvent::RolloutResumed {
                service: service.to_string(),
            },
            EventSource::Rollout,
        ));
        tokio::spawn(Arc::clone(self).drive(service.to_string(), job));
        Ok(())
    }

    /// Roll back to the previous version now. Returns the version rolled back to.
    ///
    /// With a rollout unfinished, "previous" is the version it started from.
    #[instrument(skip(self))]
    pub async fn force_rollback(self: &Arc<Self>, service: &str) -> Result<u64> {
        let mut state = self
            .services
            .get_mut(service)
            .ok_or_else(|| RolloutError::NotFound(service.to_string()))?;

        let unfinished = match (&state.target, &state.deployed) {
            (Some(target), Some(deployed)) => target.version != deployed.version,
            (Some(_), None) => true,
            _ => false,
        };
        let to = if unfinished {
            state.deployed.clone()
        } else {
            state.previous.clone()
        }
        .ok_or_else(|| {
            RolloutError::InvalidState(format!("no previous version of {} to roll back to", service))
        })?;

        let version = to.version;
        let job = Job::Rollback(Arc::clone(&to));
        state.target = Some(to);
        state.last_job = Some(job.clone());

        if state.running {
            state.control.preempt.store(true, Ordering::SeqCst);
            state.queued = Some(job);
        } else {
            state.running = true;
            state.control = Arc::new(RolloutControl::default());
            drop(state);
            tokio::spawn(Arc::clone(self).drive(service.to_string(), job));
        }

        warn!(to_version = version, "Forced rollback requested");
        Ok(version)
    }

    /// Spec the service's replicas last converged to
    pub fn deployed(&self, service: &str) -> Option<Arc<ServiceSpec>> {
        self.services.get(service).and_then(|s| s.deployed.clone())
    }

    /// Deployed spec of every service, by name
    pub fn deployed_specs(&self) -> Vec<Arc<ServiceSpec>> {
        let mut specs: Vec<Arc<ServiceSpec>> = self
            .services
            .iter()
            .filter_map(|s| s.deployed.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Hostnames any requested spec pins its replicas to
    pub fn pin_targets(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .filter_map(|s| s.target.as_ref().and_then(|t| t.pinned_hostname().map(str::to_string)))
            .collect()
    }

    pub fn is_rolling(&self, service: &str) -> bool {
        self.services.get(service).is_some_and(|s| s.running)
    }

    /// Stop managing a service and stop its replicas. A running rollout is
    /// preempted and cleans up after its current batch.
    #[instrument(skip(self))]
    pub async fn remove(&self, service: &str) -> Result<()> {
        if let Some((_, state)) = self.services.remove(service) {
            state.control.preempt.store(true, Ordering::SeqCst);
        }
        self.stop_all(service).await?;
        self.store.remove(service).await?;
        self.bump();
        Ok(())
    }

    /// Wait until no rollout task runs for `service`
    pub async fn wait_settled(&self, service: &str, bound: Duration) -> Result<Option<RolloutStatus>> {
        let mut revision = self.revision.subscribe();
        let wait = async {
            loop {
                if !self.is_rolling(service) {
                    return;
                }
                if revision.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(bound, wait)
            .await
            .map_err(|_| RolloutError::Timeout {
                service: service.to_string(),
                pending: 0,
                waited: bound,
            })?;
        self.status(service).await
    }

    async fn drive(self: Arc<Self>, service: String, mut job: Job) {
        loop {
            self.execute(&service, job).await;

            let (next, removed) = match self.services.get_mut(&service) {
                Some(mut state) => {
                    state.control = Arc::new(RolloutControl::default());
                    let next = state.queued.take();
                    if next.is_none() {
                        state.running = false;
                    }
                    (next, false)
                }
                None => (None, true),
            };
            if removed {
                if let Err(e) = self.stop_all(&service).await {
                    error!(%service, error = %e, "Cleanup of removed service failed");
                }
            }
            self.bump();

            match next {
                Some(queued) => job = queued,
                None => break,
            }
        }
    }

    async fn execute(&self, service: &str, job: Job) {
        let Some((previous, control)) = self
            .services
            .get(service)
            .map(|s| (s.deployed.clone(), Arc::clone(&s.control)))
        else {
            return;
        };

        let spec = Arc::clone(job.spec());
        let from = previous.as_ref().map(|p| p.version);
        let mut status = RolloutStatus::new(service, from, spec.version, spec.replicas);
        let kind = job.kind();

        let outcome = match job {
            Job::Rollout(_) => {
                info!(%service, from_version = ?from, to_version = spec.version, "Rollout started");
                self.emit(
                    KeelEvent::RolloutStarted {
                        service: service.to_string(),
                        from_version: from,
                        to_version: spec.version,
                    },
                    &status,
                );
                let result = self.converge(&spec, false, &control, &mut status).await;
                match result {
                    Ok(Converged::Completed { failures }) => {
                        self.mark_deployed(service, &spec);
                        status.phase = RolloutPhase::Stable {
                            version: spec.version,
                        };
                        status.last_error = failures.last().cloned();
                        self.save(&mut status).await;
                        info!(%service, version = spec.version, "Rollout completed");
                        self.emit(
                            KeelEvent::RolloutCompleted {
                                service: service.to_string(),
                                version: spec.version,
                            },
                            &status,
                        );
                        if failures.is_empty() {
                            RolloutOutcome::Completed
                        } else {
                            RolloutOutcome::CompletedWithFailures {
                                failures: failures.len() as u32,
                            }
                        }
                    }
                    Ok(Converged::Preempted) => {
                        // the partial replica set becomes the base of the next rollout
                        self.mark_deployed(service, &spec);
                        self.preempted(service, &mut status).await
                    }
                    Ok(Converged::Paused) => self.paused(service, &mut status, "paused by operator".into()).await,
                    Err(e) => self.handle_failure(service, &spec, previous, &control, &mut status, e).await,
                }
            }
            Job::Rollback(to) => {
                warn!(%service, from_version = ?from, to_version = to.version, "Rollback started");
                self.rollback(service, &to, &control, &mut status).await
            }
        };

        let record = RolloutRecord {
            id: status.id.clone(),
            service: service.to_string(),
            kind,
            from_version: from,
            to_version: spec.version,
            outcome,
            started_at: status.started_at,
            finished_at: Some(chrono::Utc::now()),
        };
        if let Err(e) = self.store.record(record).await {
            error!(%service, error = %e, "Failed to record rollout history");
        }
    }

    async fn handle_failure(
        &self,
        service: &str,
        spec: &Arc<ServiceSpec>,
        previous: Option<Arc<ServiceSpec>>,
        control: &RolloutControl,
        status: &mut RolloutStatus,
        failure: RolloutError,
    ) -> RolloutOutcome {
        let reason = failure.to_string();
        error!(%service, version = spec.version, %reason, "Rollout failed");
        status.last_error = Some(reason.clone());
        self.emit(
            KeelEvent::RolloutFailed {
                service: service.to_string(),
                version: spec.version,
                reason: reason.clone(),
            },
            status,
        );

        let action = if failure.is_quorum_violation() {
            FailureAction::Pause
        } else {
            spec.rollout.effective_failure_action(spec.role)
        };

        match (action, previous) {
            (FailureAction::Rollback, Some(previous)) => {
                self.rollback(service, &previous, control, status).await
            }
            (FailureAction::Rollback, None) => {
                self.paused(
                    service,
                    status,
                    format!("{}; no previous version to roll back to", reason),
                )
                .await
            }
            (FailureAction::Pause | FailureAction::Continue, _) => {
                self.paused(service, status, reason).await
            }
        }
    }

    async fn rollback(
        &self,
        service: &str,
        to: &Arc<ServiceSpec>,
        control: &RolloutControl,
        status: &mut RolloutStatus,
    ) -> RolloutOutcome {
        match self.converge(to, true, control, status).await {
            Ok(Converged::Completed { .. }) => {
                self.mark_deployed(service, to);
                if let Some(mut state) = self.services.get_mut(service) {
                    state.target = Some(Arc::clone(to));
                }
                status.phase = RolloutPhase::Stable {
                    version: to.version,
                };
                self.save(status).await;
                warn!(%service, to_version = to.version, "Rolled back");
                self.emit(
                    KeelEvent::RolloutRolledBack {
                        service: service.to_string(),
                        to_version: to.version,
                    },
                    status,
                );
                RolloutOutcome::RolledBack {
                    to_version: to.version,
                }
            }
            Ok(Converged::Preempted) => self.preempted(service, status).await,
            Ok(Converged::Paused) => self.paused(service, status, "paused by operator".into()).await,
            Err(e) => {
                let reason = format!("rollback to v{} failed: {}", to.version, e);
                status.last_error = Some(reason.clone());
                self.paused(service, status, reason).await
            }
        }
    }

    async fn paused(&self, service: &str, status: &mut RolloutStatus, reason: String) -> RolloutOutcome {
        warn!(%service, %reason, "Rollout paused");
        status.phase = RolloutPhase::Paused {
            reason: reason.clone(),
        };
        self.save(status).await;
        self.emit(
            KeelEvent::RolloutPaused {
                service: service.to_string(),
                reason: reason.clone(),
            },
            status,
        );
        RolloutOutcome::Paused { reason }
    }

    async fn preempted(&self, service: &str, status: &mut RolloutStatus) -> RolloutOutcome {
        let superseded_by = self
            .services
            .get(service)
            .and_then(|s| s.queued.as_ref().map(|j| j.spec().version))
            .unwrap_or_default();
        info!(%service, superseded_by, "Rollout preempted");
        self.save(status).await;
        self.emit(
            KeelEvent::RolloutPreempted {
                service: service.to_string(),
                superseded_by,
            },
            status,
        );
        RolloutOutcome::Preempted { superseded_by }
    }

    fn mark_deployed(&self, service: &str, spec: &Arc<ServiceSpec>) {
        if let Some(mut state) = self.services.get_mut(service) {
            let changed = state
                .deployed
                .as_ref()
                .map_or(true, |d| d.version != spec.version);
            if changed {
                state.previous = state.deployed.take();
                state.deployed = Some(Arc::clone(spec));
            }
        }
    }

    async fn stop_all(&self, service: &str) -> Result<()> {
        let snapshot = self.placement.snapshot();
        for replica in snapshot.for_service(service) {
            self.health.unregister(&replica.id);
            self.placement.stop_replica(&replica.id).await?;
        }
        Ok(())
    }

    pub(crate) async fn save(&self, status: &mut RolloutStatus) {
        status.updated_at = chrono::Utc::now();
        if let Err(e) = self.store.save_status(status).await {
            error!(service = %status.service, error = %e, "Failed to save rollout status");
        }
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub(crate) fn emit(&self, event: KeelEvent, status: &RolloutStatus) {
        let _ = self.event_tx.send(
            EventEnvelope::new(event, EventSource::Rollout).with_correlation(status.id.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryRolloutStateStore;
    use keel_health::HealthConfig;
    use keel_registry::{InMemoryHostInventory, InMemoryReplicaStore};
    use keel_runtime::{ConfigStore, ProbeBehavior, SimulatedRuntime};
    use keel_types::{
        HealthCheck, Host, ReplicaState, RestartCondition, RestartPolicy, Role, RolloutPlan,
    };

    const SETTLE: Duration = Duration::from_secs(600);

    struct Fixture {
        runtime: Arc<SimulatedRuntime>,
        placement: Arc<PlacementEngine>,
        controller: Arc<RolloutController>,
    }

    fn fixture() -> Fixture {
        let runtime = SimulatedRuntime::shared();
        let hosts = (1..=3).map(|i| Host::new(format!("es0{i}"), 8 << 30));
        let placement = Arc::new(PlacementEngine::new(
            Arc::new(InMemoryReplicaStore::new()),
            Arc::new(InMemoryHostInventory::with_hosts(hosts)),
            runtime.clone(),
            Arc::new(ConfigStore::new()),
        ));
        let health = Arc::new(HealthSupervisor::new(HealthConfig::fast(), placement.clone()));
        let controller = Arc::new(RolloutController::new(
            placement.clone(),
            health,
            Arc::new(InMemoryRolloutStateStore::new()),
        ));
        Fixture {
            runtime,
            placement,
            controller,
        }
    }

    fn spec(name: &str, version: u64, plan: RolloutPlan) -> ServiceSpec {
        let mut spec = ServiceSpec::new(name, format!("registry.local/{name}:{version}"))
            .with_replicas(3)
            .with_health(
                HealthCheck::shell("curl -f localhost:9200")
                    .with_interval(Duration::from_secs(1))
                    .with_timeout(Duration::from_secs(1))
                    .with_retries(1),
            )
            .with_rollout(plan);
        spec.version = version;
        spec
    }

    fn versions(f: &Fixture, service: &str) -> Vec<(u32, u64, ReplicaState)> {
        let mut replicas: Vec<_> = f
            .placement
            .snapshot()
            .for_service(service)
            .map(|r| (r.ordinal, r.version, r.state))
            .collect();
        replicas.sort_by_key(|(ordinal, version, _)| (*ordinal, *version));
        replicas
    }

    fn all_healthy(version: u64) -> Vec<(u32, u64, ReplicaState)> {
        (0..3).map(|o| (o, version, ReplicaState::Healthy)).collect()
    }

    async fn settle(f: &Fixture, service: &str) -> RolloutStatus {
        f.controller
            .wait_settled(service, SETTLE)
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_batch(rx: &mut broadcast::Receiver<EventEnvelope>, batch: u32) {
        loop {
            if let KeelEvent::BatchCompleted { batch: b, .. } = rx.recv().await.unwrap().event {
                if b == batch {
                    return;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_deployment_reaches_stable() {
        let f = fixture();
        let decision = f.controller.submit(spec("web", 1, RolloutPlan::default())).await.unwrap();
        assert_eq!(decision, SubmitDecision::Started { version: 1 });

        let status = settle(&f, "web").await;
        assert_eq!(status.phase, RolloutPhase::Stable { version: 1 });
        assert_eq!(status.updated_replicas, 3);
        assert_eq!(versions(&f, "web"), all_healthy(1));
        assert_eq!(f.controller.deployed("web").unwrap().version, 1);

        let history = f.controller.history("web").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RolloutOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_resubmit_is_unchanged() {
        let f = fixture();
        f.controller.submit(spec("web", 1, RolloutPlan::default())).await.unwrap();
        settle(&f, "web").await;
        let starts = f.runtime.start_count();

        // same content, new version number
        let mut same = spec("web", 2, RolloutPlan::default());
        same.image = "registry.local/web:1".into();
        let decision = f.controller.submit(same).await.unwrap();
        assert_eq!(decision, SubmitDecision::Unchanged { version: 1 });
        assert_eq!(f.runtime.start_count(), starts);

        f.controller.submit(spec("web", 2, RolloutPlan::default())).await.unwrap();
        let status = settle(&f, "web").await;
        assert_eq!(status.phase, RolloutPhase::Stable { version: 2 });
        assert_eq!(status.from_version, Some(1));
        assert_eq!(versions(&f, "web"), all_healthy(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_rolls_back() {
        let f = fixture();
        f.controller.submit(spec("web", 1, RolloutPlan::default())).await.unwrap();
        settle(&f, "web").await;

        let plan = RolloutPlan {
            delay: Duration::from_secs(5),
            failure_action: FailureAction::Rollback,
            restart: RestartPolicy {
                condition: RestartCondition::OnFailure,
                delay: Duration::from_secs(1),
                max_attempts: 1,
            },
            ..RolloutPlan::default()
        };
        let mut rx = f.controller.subscribe();
        f.controller.submit(spec("web", 2, plan)).await.unwrap();

        // the second batch is inside its delay when v2 starts failing
        wait_for_batch(&mut rx, 1).await;
        f.runtime.set_version_probe("web", 2, ProbeBehavior::Fail);

        let status = settle(&f, "web").await;
        assert_eq!(status.phase, RolloutPhase::Stable { version: 1 });
        assert!(status.last_error.unwrap().contains("after 1 restart"));
        assert_eq!(versions(&f, "web"), all_healthy(1));
        assert_eq!(f.controller.deployed("web").unwrap().version, 1);

        let history = f.controller.history("web").await.unwrap();
        assert_eq!(history.last().unwrap().outcome, RolloutOutcome::RolledBack { to_version: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_deployment_failure_pauses() {
        let f = fixture();
        f.runtime.set_service_probe("web", ProbeBehavior::Fail);
        let plan = RolloutPlan {
            failure_action: FailureAction::Rollback,
            restart: RestartPolicy {
                condition: RestartCondition::None,
                ..RestartPolicy::default()
            },
            ..RolloutPlan::default()
        };
        f.controller.submit(spec("web", 1, plan)).await.unwrap();

        let status = settle(&f, "web").await;
        match status.phase {
            RolloutPhase::Paused { reason } => assert!(reason.contains("no previous version")),
            other => panic!("expected paused, got {:?}", other),
        }
        assert!(f.controller.deployed("web").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_violation_pauses_without_touching_replicas() {
        let f = fixture();
        let plan = RolloutPlan {
            quorum: Some(2),
            ..RolloutPlan::default()
        };
        let master = |version| spec("es-master", version, plan.clone()).with_role(Role::Master);
        f.controller.submit(master(1)).await.unwrap();
        settle(&f, "es-master").await;

        let sick = f
            .placement
            .snapshot()
            .for_service("es-master")
            .find(|r| r.ordinal == 1)
            .unwrap()
            .id
            .clone();
        f.runtime.set_replica_probe(&sick, ProbeBehavior::Fail);
        f.controller.health.observe(&sick).await.unwrap();
        let stops = f.runtime.stop_count();

        let mut rx = f.controller.subscribe();
        f.controller.submit(master(2)).await.unwrap();
        let status = settle(&f, "es-master").await;

        assert!(matches!(status.phase, RolloutPhase::Paused { .. }));
        assert_eq!(f.runtime.stop_count(), stops);
        assert!(versions(&f, "es-master").iter().all(|(_, v, _)| *v == 1));

        let mut violated = false;
        while let Ok(envelope) = rx.try_recv() {
            if let KeelEvent::QuorumViolation { healthy, quorum, .. } = envelope.event {
                assert_eq!((healthy, quorum), (2, 2));
                violated = true;
            }
        }
        assert!(violated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let f = fixture();
        f.controller.submit(spec("web", 1, RolloutPlan::default())).await.unwrap();
        settle(&f, "web").await;
        assert!(f.controller.pause("web").is_err());

        let plan = RolloutPlan {
            delay: Duration::from_secs(5),
            ..RolloutPlan::default()
        };
        let mut rx = f.controller.subscribe();
        f.controller.submit(spec("web", 2, plan)).await.unwrap();
        wait_for_batch(&mut rx, 1).await;
        f.controller.pause("web").unwrap();

        let status = settle(&f, "web").await;
        assert!(matches!(status.phase, RolloutPhase::Paused { .. }));
        assert_eq!(status.updated_replicas, 2);

        f.controller.resume("web").await.unwrap();
        let status = settle(&f, "web").await;
        assert_eq!(status.phase, RolloutPhase::Stable { version: 2 });
        assert_eq!(versions(&f, "web"), all_healthy(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_rollback_from_stable() {
        let f = fixture();
        assert!(matches!(
            f.controller.force_rollback("web").await,
            Err(RolloutError::NotFound(_))
        ));

        f.controller.submit(spec("web", 1, RolloutPlan::default())).await.unwrap();
        settle(&f, "web").await;
        assert!(matches!(
            f.controller.force_rollback("web").await,
            Err(RolloutError::InvalidState(_))
        ));

        f.controller.submit(spec("web", 2, RolloutPlan::default())).await.unwrap();
        settle(&f, "web").await;

        assert_eq!(f.controller.force_rollback("web").await.unwrap(), 1);
        let status = settle(&f, "web").await;
        assert_eq!(status.phase, RolloutPhase::Stable { version: 1 });
        assert_eq!(versions(&f, "web"), all_healthy(1));

        let last = f.controller.history("web").await.unwrap().pop().unwrap();
        assert_eq!(last.kind, RolloutKind::Rollback);
        assert_eq!(last.outcome, RolloutOutcome::RolledBack { to_version: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_submission_preempts_after_batch() {
        let f = fixture();
        f.controller.submit(spec("web", 1, RolloutPlan::default())).await.unwrap();
        settle(&f, "web").await;

        let plan = RolloutPlan {
            delay: Duration::from_secs(5),
            ..RolloutPlan::default()
        };
        let mut rx = f.controller.subscribe();
        f.controller.submit(spec("web", 2, plan.clone())).await.unwrap();
        wait_for_batch(&mut rx, 1).await;

        let decision = f.controller.submit(spec("web", 3, plan)).await.unwrap();
        assert_eq!(
            decision,
            SubmitDecision::Queued {
                version: 3,
                preempting: 2
            }
        );

        let status = settle(&f, "web").await;
        assert_eq!(status.phase, RolloutPhase::Stable { version: 3 });
        assert_eq!(versions(&f, "web"), all_healthy(3));

        let outcomes: Vec<_> = f
            .controller
            .history("web")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![
                RolloutOutcome::Completed,
                RolloutOutcome::Preempted { superseded_by: 3 },
                RolloutOutcome::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_plan_rejected_up_front() {
        let f = fixture();
        let plan = RolloutPlan {
            parallelism: 2,
            quorum: Some(2),
            ..RolloutPlan::default()
        };
        let result = f.controller.submit(spec("es-master", 1, plan).with_role(Role::Master)).await;
        assert!(matches!(result, Err(RolloutError::InvalidPlan { .. })));
        assert_eq!(f.runtime.start_count(), 0);
        assert!(!f.controller.is_rolling("es-master"));
    }
}
