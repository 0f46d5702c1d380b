//! Stack descriptor parsing
//!
//! A stack descriptor is a compose-like YAML document. Parsing lowers it
//! into validated [`ServiceSpec`]s plus the named config blobs they mount.

use crate::units::{parse_duration, parse_memory};
use crate::{
    FailureAction, HealthCheck, Mount, MountSource, PlacementConstraint, RestartCondition,
    RestartPolicy, Role, RolloutPlan, RouteRule, ServiceSpec, SpecValidationError, Ulimit,
};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a stack descriptor
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("invalid descriptor YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service '{service}': field '{field}': {reason}")]
    InvalidField {
        service: String,
        field: String,
        reason: String,
    },

    #[error("service '{service}' references undeclared config '{config}'")]
    UnknownConfig { service: String, config: String },

    #[error("config '{config}': {reason}")]
    InvalidConfig { config: String, reason: String },

    #[error("descriptor declares no services")]
    Empty,

    #[error(transparent)]
    Validation(#[from] SpecValidationError),
}

type Result<T> = std::result::Result<T, DescriptorError>;

/// A parsed stack: service specs plus the config blobs they mount
#[derive(Debug, Clone, Default)]
pub struct StackDescriptor {
    /// Services ordered by name
    pub services: Vec<ServiceSpec>,
    /// Named config content, mounted read-only into replicas
    pub configs: BTreeMap<String, Vec<u8>>,
}

impl StackDescriptor {
    /// Parse a descriptor; `file:` configs resolve against the working directory
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_base(yaml, None)
    }

    /// Parse a descriptor, resolving `file:` configs against `base`
    pub fn from_yaml_with_base(yaml: &str, base: Option<&Path>) -> Result<Self> {
        let raw: RawDescriptor = serde_yaml::from_str(yaml)?;
        raw.lower(base)
    }

    /// Load a descriptor file; `file:` configs resolve next to it
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_with_base(&yaml, path.parent())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    configs: BTreeMap<String, RawConfig>,
    #[serde(default)]
    services: BTreeMap<String, RawService>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    image: String,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    environment: Option<RawEnvironment>,
    #[serde(default)]
    ulimits: BTreeMap<String, RawUlimit>,
    #[serde(default)]
    configs: Vec<RawConfigRef>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    healthcheck: Option<RawHealthcheck>,
    #[serde(default)]
    deploy: RawDeploy,
    #[serde(default)]
    labels: BTreeMap<String, Value>,
    #[serde(default)]
    routes: Vec<RouteRule>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    Map(BTreeMap<String, Value>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUlimit {
    Single(i64),
    Pair { soft: i64, hard: i64 },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawConfigRef {
    Short(String),
    Long {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTest {
    List(Vec<String>),
    Shell(String),
}

#[derive(Debug, Deserialize)]
struct RawHealthcheck {
    #[serde(default)]
    test: Option<RawTest>,
    #[serde(default)]
    interval: Option<Value>,
    #[serde(default)]
    timeout: Option<Value>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    start_period: Option<Value>,
    #[serde(default)]
    disable: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawDeploy {
    #[serde(default)]
    replicas: Option<u32>,
    #[serde(default)]
    placement: RawPlacement,
    #[serde(default)]
    resources: RawResources,
    #[serde(default)]
    update_config: Option<RawUpdateConfig>,
    #[serde(default)]
    restart_policy: Option<RawRestartPolicy>,
    #[serde(default)]
    quorum: Option<u32>,
    #[serde(default)]
    labels: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPlacement {
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    max_replicas_per_node: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawResources {
    #[serde(default)]
    limits: RawLimits,
}

#[derive(Debug, Default, Deserialize)]
struct RawLimits {
    #[serde(default)]
    memory: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawUpdateConfig {
    #[serde(default)]
    parallelism: Option<u32>,
    #[serde(default)]
    delay: Option<Value>,
    #[serde(default)]
    failure_action: Option<FailureAction>,
    #[serde(default)]
    monitor: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawRestartPolicy {
    #[serde(default)]
    condition: Option<RestartCondition>,
    #[serde(default)]
    delay: Option<Value>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

impl RawDescriptor {
    fn lower(self, base: Option<&Path>) -> Result<StackDescriptor> {
        if self.services.is_empty() {
            return Err(DescriptorError::Empty);
        }

        let mut configs = BTreeMap::new();
        for (name, raw) in self.configs {
            let bytes = match (raw.content, raw.file) {
                (Some(content), None) => content.into_bytes(),
                (None, Some(file)) => {
                    let path = match base {
                        Some(dir) => dir.join(&file),
                        None => PathBuf::from(&file),
                    };
                    std::fs::read(&path).map_err(|source| DescriptorError::Io { path, source })?
                }
                _ => {
                    return Err(DescriptorError::InvalidConfig {
                        config: name,
                        reason: "exactly one of 'content' or 'file' is required".into(),
                    })
                }
            };
            configs.insert(name, bytes);
        }

        let mut services = Vec::with_capacity(self.services.len());
        for (name, raw) in self.services {
            let spec = raw.lower(&name, &configs)?;
            spec.validate()?;
            services.push(spec);
        }

        Ok(StackDescriptor { services, configs })
    }
}

impl RawService {
    fn lower(self, name: &str, configs: &BTreeMap<String, Vec<u8>>) -> Result<ServiceSpec> {
        let invalid = |field: &str, reason: String| DescriptorError::InvalidField {
            service: name.to_string(),
            field: field.to_string(),
            reason,
        };

        let mut spec = ServiceSpec::new(name, self.image);
        spec.role = self.role.unwrap_or_default();
        spec.replicas = self.deploy.replicas.unwrap_or(1);

        spec.environment = match self.environment {
            None => BTreeMap::new(),
            Some(RawEnvironment::Map(map)) => map
                .into_iter()
                .map(|(k, v)| (k, scalar_to_string(&v)))
                .collect(),
            Some(RawEnvironment::List(list)) => list
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry, String::new()),
                })
                .collect(),
        };

        for (limit, raw) in self.ulimits {
            let value = match raw {
                RawUlimit::Single(v) => Ulimit::fixed(v),
                RawUlimit::Pair { soft, hard } => Ulimit { soft, hard },
            };
            spec.ulimits.insert(limit, value);
        }

        for reference in self.configs {
            let (source, target) = match reference {
                RawConfigRef::Short(source) => (source, None),
                RawConfigRef::Long { source, target } => (source, target),
            };
            if !configs.contains_key(&source) {
                return Err(DescriptorError::UnknownConfig {
                    service: name.to_string(),
                    config: source,
                });
            }
            let target = target.unwrap_or_else(|| format!("/{}", source));
            spec.mounts.push(Mount {
                source: MountSource::Config { name: source },
                target,
                read_only: true,
            });
        }

        for volume in self.volumes {
            spec.mounts
                .push(parse_volume(&volume).map_err(|reason| invalid("volumes", reason))?);
        }

        if let Some(check) = self.healthcheck {
            spec.health = lower_healthcheck(check).map_err(|(field, reason)| {
                invalid(&format!("healthcheck.{}", field), reason)
            })?;
        }

        for constraint in self.deploy.placement.constraints {
            let parsed: PlacementConstraint = constraint
                .parse()
                .map_err(|reason| invalid("deploy.placement.constraints", reason))?;
            spec.constraints.push(parsed);
        }
        spec.max_replicas_per_host = self.deploy.placement.max_replicas_per_node;

        if let Some(memory) = self.deploy.resources.limits.memory {
            let bytes = match &memory {
                Value::Number(n) => n.as_u64().ok_or_else(|| "must be a positive integer".to_string()),
                Value::String(s) => parse_memory(s),
                _ => Err("expected a memory quantity".to_string()),
            }
            .map_err(|reason| invalid("deploy.resources.limits.memory", reason))?;
            spec.resources.memory_bytes = Some(bytes);
        }

        let mut plan = RolloutPlan::default();
        if let Some(update) = self.deploy.update_config {
            if let Some(parallelism) = update.parallelism {
                plan.parallelism = parallelism;
            }
            if let Some(delay) = update.delay {
                plan.delay = duration_value(&delay)
                    .map_err(|reason| invalid("deploy.update_config.delay", reason))?;
            }
            if let Some(action) = update.failure_action {
                plan.failure_action = action;
            }
            if let Some(monitor) = update.monitor {
                plan.monitor = duration_value(&monitor)
                    .map_err(|reason| invalid("deploy.update_config.monitor", reason))?;
            }
        }
        if let Some(restart) = self.deploy.restart_policy {
            let mut policy = RestartPolicy::default();
            if let Some(condition) = restart.condition {
                policy.condition = condition;
            }
            if let Some(delay) = restart.delay {
                policy.delay = duration_value(&delay)
                    .map_err(|reason| invalid("deploy.restart_policy.delay", reason))?;
            }
            if let Some(max) = restart.max_attempts {
                policy.max_attempts = max;
            }
            plan.restart = policy;
        }
        plan.quorum = self.deploy.quorum;
        spec.rollout = plan;

        // deploy labels win over service labels
        for (key, value) in self.labels.into_iter().chain(self.deploy.labels) {
            spec.labels.insert(key, scalar_to_string(&value));
        }
        spec.routes = self.routes;

        Ok(spec)
    }
}

fn lower_healthcheck(
    mut check: RawHealthcheck,
) -> std::result::Result<Option<HealthCheck>, (&'static str, String)> {
    if check.disable {
        return Ok(None);
    }

    let command = match check.test.take() {
        None => return Err(("test", "missing test command".into())),
        Some(RawTest::Shell(cmd)) => {
            return Ok(Some(apply_timings(HealthCheck::shell(cmd), &check)?))
        }
        Some(RawTest::List(list)) => list,
    };

    let (kind, rest) = match command.split_first() {
        Some((kind, rest)) => (kind.as_str(), rest),
        None => return Err(("test", "empty test command".into())),
    };
    let health = match kind {
        "NONE" => return Ok(None),
        "CMD" => HealthCheck::new(rest.to_vec()),
        "CMD-SHELL" => HealthCheck::shell(rest.join(" ")),
        other => {
            return Err((
                "test",
                format!("expected CMD, CMD-SHELL or NONE, got '{}'", other),
            ))
        }
    };
    Ok(Some(apply_timings(health, &check)?))
}

fn apply_timings(
    mut health: HealthCheck,
    check: &RawHealthcheck,
) -> std::result::Result<HealthCheck, (&'static str, String)> {
    if let Some(v) = &check.interval {
        health.interval = duration_value(v).map_err(|e| ("interval", e))?;
    }
    if let Some(v) = &check.timeout {
        health.timeout = duration_value(v).map_err(|e| ("timeout", e))?;
    }
    if let Some(v) = &check.start_period {
        health.start_period = duration_value(v).map_err(|e| ("start_period", e))?;
    }
    if let Some(retries) = check.retries {
        health.retries = retries;
    }
    Ok(health)
}

fn parse_volume(volume: &str) -> std::result::Result<Mount, String> {
    let parts: Vec<&str> = volume.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => return Err(format!("expected 'source:target[:ro]', got '{}'", volume)),
    };
    if source.is_empty() || !target.starts_with('/') {
        return Err(format!("invalid volume '{}'", volume));
    }

    let read_only = match mode {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => return Err(format!("unknown volume mode '{}'", other)),
    };
    let source = if source.starts_with('/') || source.starts_with('.') {
        MountSource::Bind {
            path: source.to_string(),
        }
    } else {
        MountSource::Volume {
            name: source.to_string(),
        }
    };

    Ok(Mount {
        source,
        target: target.to_string(),
        read_only,
    })
}

fn duration_value(value: &Value) -> std::result::Result<Duration, String> {
    match value {
        Value::String(s) => parse_duration(s),
        Value::Number(n) => n
            .as_f64()
            .filter(|secs| *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| format!("invalid duration {}", n)),
        _ => Err("expected a duration".into()),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    const STACK: &str = r#"
version: "1"
configs:
  es_config:
    content: "cluster.name: labs"
services:
  es-master-1:
    image: registry.local/search:8.11
    role: master
    environment:
      node.name: es-master-1
      discovery.seed_hosts: es-master-2,es-master-3
    ulimits:
      memlock: { soft: -1, hard: -1 }
      nofile: 65536
    configs:
      - source: es_config
        target: /etc/search/search.yml
    volumes:
      - "es-data-1:/var/lib/search"
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost:9200"]
      interval: 30s
      timeout: 10s
      retries: 5
      start_period: 60s
    deploy:
      replicas: 1
      placement:
        constraints: ["node.hostname == es01"]
        max_replicas_per_node: 1
      resources:
        limits:
          memory: 2g
      update_config:
        parallelism: 1
        delay: 10s
        failure_action: rollback
        monitor: 60s
      restart_policy:
        condition: on-failure
        delay: 5s
        max_attempts: 3
  kibana:
    image: registry.local/kibana:8.11
    role: edge-facing
    healthcheck:
      test: "curl -fs http://localhost:5601/api/status"
    deploy:
      labels:
        edge.enable: true
        edge.host: kibana-labs.example.com
        edge.port: 5601
        edge.tls: "true"
        edge.redirect_https: "true"
"#;

    #[test]
    fn test_parse_full_stack() {
        let stack = StackDescriptor::from_yaml(STACK).unwrap();
        assert_eq!(stack.services.len(), 2);
        assert_eq!(stack.configs["es_config"], b"cluster.name: labs".to_vec());

        let master = stack.service("es-master-1").unwrap();
        assert_eq!(master.role, Role::Master);
        assert_eq!(master.pinned_hostname(), Some("es01"));
        assert_eq!(master.max_replicas_per_host, Some(1));
        assert_eq!(master.resources.memory_bytes, Some(2 << 30));
        assert_eq!(master.ulimits["memlock"], Ulimit::unlimited());
        assert_eq!(master.ulimits["nofile"], Ulimit::fixed(65536));
        assert_eq!(master.mounts.len(), 2);
        assert!(master.mounts[0].read_only);

        let health = master.health.as_ref().unwrap();
        assert_eq!(health.command, vec!["curl", "-f", "http://localhost:9200"]);
        assert_eq!(health.retries, 5);
        assert_eq!(health.start_period, Duration::from_secs(60));

        assert_eq!(master.rollout.failure_action, FailureAction::Rollback);
        assert_eq!(master.rollout.restart.condition, RestartCondition::OnFailure);
        assert_eq!(master.rollout.delay, Duration::from_secs(10));
    }

    #[test]
    fn test_labels_become_routes() {
        let stack = StackDescriptor::from_yaml(STACK).unwrap();
        let kibana = stack.service("kibana").unwrap();
        assert_eq!(kibana.labels["edge.port"], "5601");

        let routes = kibana.effective_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].transport, Transport::Https);
        assert!(routes[0].force_https);

        let health = kibana.health.as_ref().unwrap();
        assert_eq!(health.command[0], "/bin/sh");
    }

    #[test]
    fn test_unknown_config_is_rejected() {
        let yaml = r#"
services:
  web:
    image: nginx
    configs: [missing]
"#;
        let err = StackDescriptor::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownConfig { ref config, .. } if config == "missing"));
    }

    #[test]
    fn test_bad_field_names_service_and_field() {
        let yaml = r#"
services:
  web:
    image: nginx
    deploy:
      resources:
        limits:
          memory: lots
"#;
        let err = StackDescriptor::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("web"));
        assert!(err.contains("deploy.resources.limits.memory"));
    }

    #[test]
    fn test_healthcheck_none_disables() {
        let yaml = r#"
services:
  worker:
    image: busybox
    healthcheck:
      test: ["NONE"]
"#;
        let stack = StackDescriptor::from_yaml(yaml).unwrap();
        assert!(stack.services[0].health.is_none());
    }

    #[test]
    fn test_validation_errors_surface() {
        let yaml = r#"
services:
  es-master:
    image: search
    deploy:
      replicas: 3
      quorum: 5
"#;
        assert!(matches!(
            StackDescriptor::from_yaml(yaml),
            Err(DescriptorError::Validation(SpecValidationError::InvalidQuorum { .. }))
        ));
        assert!(matches!(
            StackDescriptor::from_yaml("services: {}"),
            Err(DescriptorError::Empty)
        ));
    }

    #[test]
    fn test_volume_parsing() {
        let bind = parse_volume("/srv/data:/data:ro").unwrap();
        assert!(matches!(bind.source, MountSource::Bind { .. }));
        assert!(bind.read_only);
        assert!(parse_volume("nodest").is_err());
    }
}
