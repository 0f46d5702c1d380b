//! Placement planning
//!
//! Pure functions: no I/O, no clocks, deterministic output for a given input.

use crate::error::{PlacementError, Result};
use keel_types::{Host, HostId, ReplicaId, ReplicaInstance, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A replica to be started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub service: String,
    pub version: u64,
    pub ordinal: u32,
    pub host: HostId,
    pub memory_bytes: u64,
    /// Replica of an older version occupying this ordinal, if any
    pub replaces: Option<ReplicaId>,
}

/// Why a replica leaves the desired set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Ordinal beyond the desired replica count
    ScaledDown,
    /// Service no longer desired
    ServiceRemoved,
    /// Host left the inventory
    HostGone,
    /// Host no longer satisfies the spec's constraints
    ConstraintViolated,
    /// Another replica already occupies the ordinal
    Duplicate,
    /// Older version left behind next to a current-version replica
    Superseded,
}

/// A replica to be stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    pub replica: ReplicaId,
    pub service: String,
    pub version: u64,
    pub ordinal: u32,
    pub host: HostId,
    pub reason: RemovalReason,
}

/// Placement diff between desired and current state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub additions: Vec<Placement>,
    pub removals: Vec<Removal>,
}

impl PlacementPlan {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Additions for one service
    pub fn additions_for<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a Placement> {
        self.additions.iter().filter(move |p| p.service == service)
    }
}

#[derive(Debug, Default, Clone)]
struct HostLoad {
    memory_used: u64,
    replicas: u32,
    per_service: BTreeMap<String, u32>,
}

/// Hostnames that some service pins replicas to with an exact-hostname constraint
pub fn pin_targets<'a>(specs: impl IntoIterator<Item = &'a ServiceSpec>) -> BTreeSet<String> {
    specs
        .into_iter()
        .filter_map(|s| s.pinned_hostname().map(str::to_string))
        .collect()
}

/// Host capacity ledger used while planning
struct Ledger<'a> {
    hosts: BTreeMap<&'a HostId, &'a Host>,
    load: BTreeMap<HostId, HostLoad>,
    /// Pin targets; only services pinned there may use them
    reserved: BTreeSet<String>,
}

impl<'a> Ledger<'a> {
    fn new(hosts: &'a [Host], reserved: BTreeSet<String>) -> Self {
        Self {
            hosts: hosts.iter().map(|h| (&h.id, h)).collect(),
            load: BTreeMap::new(),
            reserved,
        }
    }

    /// Whether `spec` may run on `host` given other services' pins
    fn admits(&self, spec: &ServiceSpec, host: &Host) -> bool {
        !self.reserved.contains(&host.hostname) || spec.pinned_hostname() == Some(host.hostname.as_str())
    }

    fn host(&self, id: &HostId) -> Option<&'a Host> {
        self.hosts.get(id).copied()
    }

    fn occupy(&mut self, host: &HostId, service: &str, memory: u64) {
        let load = self.load.entry(host.clone()).or_default();
        load.memory_used = load.memory_used.saturating_add(memory);
        load.replicas += 1;
        *load.per_service.entry(service.to_string()).or_insert(0) += 1;
    }

    fn load(&self, host: &HostId) -> HostLoad {
        self.load.get(host).cloned().unwrap_or_default()
    }

    /// Pick a host for one replica, or explain why none qualifies
    fn choose(
        &self,
        spec: &ServiceSpec,
        preferred: Option<&HostId>,
    ) -> std::result::Result<HostId, String> {
        let schedulable: Vec<&Host> = self.hosts.values().copied().filter(|h| h.schedulable).collect();
        if schedulable.is_empty() {
            return Err("no schedulable hosts in inventory".into());
        }

        let open: Vec<&Host> = schedulable.iter().copied().filter(|h| self.admits(spec, h)).collect();
        if open.is_empty() {
            return Err("every schedulable host is reserved for services pinned to it".into());
        }

        let matching: Vec<&Host> = open
            .iter()
            .copied()
            .filter(|h| spec.constraints.iter().all(|c| c.matches(h)))
            .collect();
        if matching.is_empty() {
            let culprit = spec
                .constraints
                .iter()
                .find(|c| !open.iter().any(|h| c.matches(h)));
            return Err(match culprit {
                Some(c) => format!("no schedulable host satisfies constraint '{}'", c),
                None => format!(
                    "no schedulable host satisfies all constraints [{}]",
                    spec.constraints
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }

        let granting: Vec<&Host> = matching
            .iter()
            .copied()
            .filter(|h| {
                spec.ulimits.iter().all(|(name, limit)| {
                    h.ulimits.get(name).map_or(true, |ceiling| limit.fits_within(*ceiling))
                })
            })
            .collect();
        if granting.is_empty() {
            let name = spec
                .ulimits
                .iter()
                .find(|(name, limit)| {
                    !matching.iter().any(|h| {
                        h.ulimits
                            .get(*name)
                            .map_or(true, |ceiling| limit.fits_within(*ceiling))
                    })
                })
                .map(|(name, _)| name.as_str())
                .unwrap_or("?");
            return Err(format!("no eligible host can grant ulimit '{}'", name));
        }

        let need = spec.memory_bytes();
        let fitting: Vec<&Host> = granting
            .iter()
            .copied()
            .filter(|h| self.load(&h.id).memory_used.saturating_add(need) <= h.memory_bytes)
            .collect();
        if fitting.is_empty() {
            let (best_host, best_free) = granting
                .iter()
                .map(|h| (&h.id, h.memory_bytes.saturating_sub(self.load(&h.id).memory_used)))
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(id, free)| (id.to_string(), free))
                .unwrap_or_default();
            return Err(format!(
                "insufficient memory: replica needs {} bytes, most free on an eligible host is {} bytes ({})",
                need, best_free, best_host
            ));
        }

        let spread: Vec<&Host> = match spec.max_replicas_per_host {
            Some(max) => fitting
                .iter()
                .copied()
                .filter(|h| {
                    self.load(&h.id)
                        .per_service
                        .get(&spec.name)
                        .copied()
                        .unwrap_or(0)
                        < max
                })
                .collect(),
            None => fitting,
        };
        if spread.is_empty() {
            return Err(format!(
                "max_replicas_per_host={} reached on every eligible host",
                spec.max_replicas_per_host.unwrap_or(0)
            ));
        }

        spread
            .iter()
            .min_by_key(|h| (Some(&h.id) != preferred, self.load(&h.id).replicas, h.id.clone()))
            .map(|h| h.id.clone())
            .ok_or_else(|| "no eligible host".to_string())
    }
}

fn unschedulable(spec: &ServiceSpec, ordinal: u32, reason: String) -> PlacementError {
    PlacementError::Unschedulable {
        service: spec.name.clone(),
        version: spec.version,
        ordinal,
        reason,
    }
}

fn removal(replica: &ReplicaInstance, reason: RemovalReason) -> Removal {
    Removal {
        replica: replica.id.clone(),
        service: replica.service.clone(),
        version: replica.version,
        ordinal: replica.ordinal,
        host: replica.host.clone(),
        reason,
    }
}

/// Compute the placement diff that moves `current` towards `desired`.
///
/// Live replicas of the desired version stay where they are. Replicas of an
/// older version are not removed: the addition for their ordinal names them
/// in `replaces` and prefers their host, and the rollout controller performs
/// the swap. A host that some desired service pins to takes only replicas
/// pinned to it. Fails on the first replica no host can take.
pub fn reconcile(
    desired: &[ServiceSpec],
    hosts: &[Host],
    current: &[ReplicaInstance],
) -> Result<PlacementPlan> {
    let mut specs: Vec<&ServiceSpec> = desired.iter().collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    let by_name: BTreeMap<&str, &ServiceSpec> = specs.iter().map(|s| (s.name.as_str(), *s)).collect();

    let mut live: Vec<&ReplicaInstance> = current.iter().filter(|r| r.is_live()).collect();
    // newest version first so the survivor of a duplicate ordinal is the newest
    live.sort_by(|a, b| {
        (&a.service, a.ordinal, std::cmp::Reverse(a.version), a.created_at, &a.id).cmp(&(
            &b.service,
            b.ordinal,
            std::cmp::Reverse(b.version),
            b.created_at,
            &b.id,
        ))
    });

    let mut ledger = Ledger::new(hosts, pin_targets(specs.iter().copied()));
    let mut plan = PlacementPlan::default();
    let mut kept: BTreeSet<(&str, u32)> = BTreeSet::new();
    let mut older: BTreeMap<(&str, u32), &ReplicaInstance> = BTreeMap::new();

    for replica in &live {
        let Some(spec) = by_name.get(replica.service.as_str()) else {
            plan.removals.push(removal(replica, RemovalReason::ServiceRemoved));
            continue;
        };
        if replica.ordinal >= spec.replicas {
            plan.removals.push(removal(replica, RemovalReason::ScaledDown));
            continue;
        }
        let Some(host) = ledger.host(&replica.host) else {
            plan.removals.push(removal(replica, RemovalReason::HostGone));
            continue;
        };

        let slot = (replica.service.as_str(), replica.ordinal);
        if replica.version == spec.version {
            if !spec.constraints.iter().all(|c| c.matches(host)) || !ledger.admits(spec, host) {
                plan.removals.push(removal(replica, RemovalReason::ConstraintViolated));
            } else if !kept.insert(slot) {
                plan.removals.push(removal(replica, RemovalReason::Duplicate));
            } else {
                ledger.occupy(&replica.host, &replica.service, replica.memory_bytes);
            }
        } else if older.contains_key(&slot) {
            plan.removals.push(removal(replica, RemovalReason::Duplicate));
        } else {
            older.insert(slot, replica);
        }
    }

    // an older replica next to a current one is leftover from an interrupted swap
    let mut older_pending: BTreeMap<(&str, u32), &ReplicaInstance> = BTreeMap::new();
    for (slot, replica) in older {
        if kept.contains(&slot) {
            plan.removals.push(removal(replica, RemovalReason::Superseded));
        } else {
            older_pending.insert(slot, replica);
        }
    }

    for spec in specs {
        for ordinal in 0..spec.replicas {
            if kept.contains(&(spec.name.as_str(), ordinal)) {
                continue;
            }
            let replaced = older_pending.get(&(spec.name.as_str(), ordinal));
            let host = ledger
                .choose(spec, replaced.map(|r| &r.host))
                .map_err(|reason| unschedulable(spec, ordinal, reason))?;
            ledger.occupy(&host, &spec.name, spec.memory_bytes());
            plan.additions.push(Placement {
                service: spec.name.clone(),
                version: spec.version,
                ordinal,
                host,
                memory_bytes: spec.memory_bytes(),
                replaces: replaced.map(|r| r.id.clone()),
            });
        }
    }

    plan.removals.sort_by(|a, b| (&a.service, a.ordinal).cmp(&(&b.service, b.ordinal)));
    Ok(plan)
}

/// Place new-version replicas for a batch of ordinals of one service.
///
/// Every live replica outside the batch keeps its capacity; replicas of the
/// service at the batch ordinals are treated as already gone, and each new
/// replica prefers the host of the one it replaces. Hosts in `reserved` are
/// skipped unless `spec` is pinned to them.
pub fn plan_replacements(
    spec: &ServiceSpec,
    ordinals: &[u32],
    hosts: &[Host],
    current: &[ReplicaInstance],
    reserved: BTreeSet<String>,
) -> Result<Vec<Placement>> {
    let batch: BTreeSet<u32> = ordinals.iter().copied().collect();
    let mut ledger = Ledger::new(hosts, reserved);
    let mut replaced: BTreeMap<u32, &ReplicaInstance> = BTreeMap::new();

    for replica in current.iter().filter(|r| r.is_live()) {
        if replica.service == spec.name && batch.contains(&replica.ordinal) {
            let entry = replaced.entry(replica.ordinal).or_insert(replica);
            if replica.version > entry.version {
                *entry = replica;
            }
            continue;
        }
        ledger.occupy(&replica.host, &replica.service, replica.memory_bytes);
    }

    let mut placements = Vec::with_capacity(batch.len());
    for ordinal in batch {
        let previous = replaced.get(&ordinal);
        let host = ledger
            .choose(spec, previous.map(|r| &r.host))
            .map_err(|reason| unschedulable(spec, ordinal, reason))?;
        ledger.occupy(&host, &spec.name, spec.memory_bytes());
        placements.push(Placement {
            service: spec.name.clone(),
            version: spec.version,
            ordinal,
            host,
            memory_bytes: spec.memory_bytes(),
            replaces: previous.map(|r| r.id.clone()),
        });
    }
    Ok(placements)
}
