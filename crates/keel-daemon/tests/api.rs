//! Management API over an in-process control plane

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use keel_daemon::config::HostEntry;
use keel_daemon::{DaemonConfig, Server};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

struct Harness {
    app: Router,
    server: Server,
    _shutdown: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let mut config = DaemonConfig::default();
    config.inventory.hosts = ["es01", "es02", "es03"]
        .into_iter()
        .map(|hostname| HostEntry {
            hostname: hostname.to_string(),
            memory: "8g".to_string(),
            role: None,
            labels: BTreeMap::new(),
            ulimits: BTreeMap::new(),
            address: None,
        })
        .collect();
    config.health = keel_health::HealthConfig::fast();
    config.certs.poll_interval = Duration::from_millis(50);
    config.scheduler.supervise_interval_ms = 100;
    config.scheduler.auto_certificates = false;

    let server = Server::new(config).await.unwrap();
    let (shutdown, rx) = watch::channel(false);
    server.control().start(rx);
    Harness {
        app: server.app(),
        server,
        _shutdown: shutdown,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test(start_paused = true)]
async fn health_and_status() {
    let h = harness().await;

    let (status, body) = call(&h.app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(&h.app, Method::GET, "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fleet"]["hosts"], 3);
    assert_eq!(body["fleet"]["services"], 0);
}

#[tokio::test(start_paused = true)]
async fn submit_and_inspect_a_service() {
    let h = harness().await;
    let spec = json!({
        "name": "kibana",
        "image": "registry.local/kibana:8.11",
        "replicas": 2,
        "role": "edge-facing",
    });

    let (status, body) = call(&h.app, Method::POST, "/api/v1/services", Some(spec.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["version"], 1);

    h.server
        .control()
        .rollout()
        .wait_settled("kibana", Duration::from_secs(300))
        .await
        .unwrap();

    let (status, body) = call(&h.app, Method::GET, "/api/v1/services/kibana", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["latest_version"], 1);
    assert_eq!(body["healthy_replicas"], 2);

    // identical resubmission changes nothing
    let (status, body) = call(&h.app, Method::POST, "/api/v1/services", Some(spec)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registry"]["outcome"], "unchanged");

    let (status, body) = call(&h.app, Method::GET, "/api/v1/replicas?service=kibana", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (status, body) = call(&h.app, Method::GET, "/api/v1/services/kibana/rollout", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target_version"], 1);

    let (status, _) = call(&h.app, Method::GET, "/api/v1/services/grafana", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn quorum_plan_with_large_batches_is_rejected() {
    let h = harness().await;
    let spec = json!({
        "name": "es-master",
        "image": "registry.local/search:8.11",
        "replicas": 3,
        "role": "master",
        "rollout": { "parallelism": 2, "quorum": 2 },
    });

    let (status, body) = call(&h.app, Method::POST, "/api/v1/services", Some(spec)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (_, services) = call(&h.app, Method::GET, "/api/v1/services", None).await;
    assert_eq!(services.as_array().map(Vec::len), Some(0));
}

#[tokio::test(start_paused = true)]
async fn stack_upload_accepts_yaml() {
    let h = harness().await;
    let yaml = r#"
services:
  es01:
    image: registry.local/search:8.11
    role: master
    deploy:
      placement:
        constraints: ["node.hostname == es01"]
"#;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/stacks")
        .header("content-type", "application/yaml")
        .body(Body::from(yaml))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let broken = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/stacks")
        .body(Body::from("services: ["))
        .unwrap();
    let response = h.app.clone().oneshot(broken).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test(start_paused = true)]
async fn hosts_can_be_added_and_guarded() {
    let h = harness().await;

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/api/v1/hosts",
        Some(json!({ "hostname": "es04", "memory": "16g", "labels": { "zone": "b" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["memory_bytes"], 16u64 << 30);

    let (_, hosts) = call(&h.app, Method::GET, "/api/v1/hosts", None).await;
    assert_eq!(hosts.as_array().map(Vec::len), Some(4));

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/api/v1/hosts",
        Some(json!({ "hostname": "es05", "memory": "plenty" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let spec = json!({
        "name": "es-data",
        "image": "registry.local/search:8.11",
        "replicas": 1,
        "constraints": [{ "key": "node.hostname", "op": "eq", "value": "es04" }],
    });
    let (status, _) = call(&h.app, Method::POST, "/api/v1/services", Some(spec)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    h.server
        .control()
        .rollout()
        .wait_settled("es-data", Duration::from_secs(300))
        .await
        .unwrap();

    let (status, body) = call(&h.app, Method::DELETE, "/api/v1/hosts/es04", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, _) = call(
        &h.app,
        Method::PUT,
        "/api/v1/hosts/es04/schedulable",
        Some(json!({ "schedulable": false })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test(start_paused = true)]
async fn certificates_are_issued_on_demand() {
    let h = harness().await;

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/api/v1/certificates/kibana-labs.example.com/ensure",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["domain"], "kibana-labs.example.com");
    assert_eq!(body["valid"], true);

    let (_, certs) = call(&h.app, Method::GET, "/api/v1/certificates", None).await;
    assert_eq!(certs.as_array().map(Vec::len), Some(1));

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/api/v1/certificates/*.example.com/ensure",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // the event log is fed by a forwarding task
    let mut logged = false;
    for _ in 0..50 {
        let (_, events) = call(
            &h.app,
            Method::GET,
            "/api/v1/events?source=certificates",
            None,
        )
        .await;
        if events
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["event"]["type"] == "certificate_issued")
        {
            logged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(logged, "certificate_issued never reached the event log");
}

#[tokio::test(start_paused = true)]
async fn routes_follow_service_labels() {
    let h = harness().await;
    let spec = json!({
        "name": "grafana",
        "image": "registry.local/grafana:10",
        "replicas": 1,
        "labels": {
            "edge.enable": "true",
            "edge.host": "grafana.example.com",
            "edge.port": "3000",
        },
    });
    let (status, _) = call(&h.app, Method::POST, "/api/v1/services", Some(spec)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, routes) = call(&h.app, Method::GET, "/api/v1/routes", None).await;
    assert_eq!(status, StatusCode::OK);
    let routes = routes.as_array().unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0]["host"], "grafana.example.com");
    assert_eq!(routes[0]["tls"], false);
}
