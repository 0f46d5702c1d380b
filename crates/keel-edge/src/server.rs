//! Edge listeners
//!
//! One plaintext listener and, when enabled, one TLS listener. Both run the
//! same handler; only the `secure` flag differs.

use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::proxy::{ClientInfo, Forwarder, UpstreamRequest};
use crate::resolver::{server_config, SniResolver};
use crate::router::EdgeRouter;
use crate::table::RouteDecision;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use keel_certs::CertStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct EdgeState {
    router: Arc<EdgeRouter>,
    forwarder: Forwarder,
    secure: bool,
}

/// Handler for every request on one listener
pub fn edge_app(router: Arc<EdgeRouter>, forwarder: Forwarder, secure: bool) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(EdgeState {
            router,
            forwarder,
            secure,
        })
        .layer(TraceLayer::new_for_http())
}

async fn handle(
    State(state): State<EdgeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match state.router.decide(&host, path, state.secure) {
        RouteDecision::NotFound => (StatusCode::NOT_FOUND, "no route for host\n").into_response(),
        RouteDecision::Redirect { location } => match HeaderValue::from_str(&location) {
            Ok(location) => (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, location)]).into_response(),
            Err(_) => StatusCode::BAD_REQUEST.into_response(),
        },
        RouteDecision::Refused { host } => {
            (StatusCode::MISDIRECTED_REQUEST, format!("no certificate for {}\n", host)).into_response()
        }
        RouteDecision::ServiceUnavailable { service } => {
            (StatusCode::SERVICE_UNAVAILABLE, format!("no healthy replica of {}\n", service)).into_response()
        }
        RouteDecision::Challenge { key_authorization } => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            key_authorization,
        )
            .into_response(),
        RouteDecision::Proxy { service, endpoint } => {
            let body = match axum::body::to_bytes(body, state.forwarder.max_body_bytes()).await {
                Ok(body) => body,
                Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            };
            let client = ClientInfo {
                peer,
                host,
                secure: state.secure,
            };
            let upstream = UpstreamRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            };
            match state.forwarder.forward(&endpoint, upstream, &client).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(%service, %endpoint, error = %e, "Upstream request failed");
                    (StatusCode::BAD_GATEWAY, Body::from("upstream unavailable\n")).into_response()
                }
            }
        }
    }
}

/// Plaintext and TLS listeners sharing one router
pub struct EdgeServer {
    config: EdgeConfig,
    router: Arc<EdgeRouter>,
    certs: Arc<CertStore>,
    forwarder: Forwarder,
}

impl EdgeServer {
    pub fn new(config: EdgeConfig, router: Arc<EdgeRouter>, certs: Arc<CertStore>) -> Result<Self> {
        let forwarder = Forwarder::new(&config)?;
        Ok(Self {
            config,
            router,
            certs,
            forwarder,
        })
    }

    /// Serve until `shutdown` flips to true, then drain in-flight requests
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let http = self.serve_http(shutdown.clone());
        if !self.config.enable_tls {
            return http.await;
        }
        let https = self.serve_https(shutdown);
        tokio::try_join!(http, https)?;
        Ok(())
    }

    async fn serve_http(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.http_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EdgeError::Bind { addr, source })?;
        info!(%addr, "Edge HTTP listener started");

        let app = edge_app(self.router.clone(), self.forwarder.clone(), false);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .await?;
        info!(%addr, "Edge HTTP listener stopped");
        Ok(())
    }

    async fn serve_https(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.https_addr;
        let resolver = Arc::new(SniResolver::new(self.certs.clone()));
        let tls = RustlsConfig::from_config(server_config(resolver)?);

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        tokio::spawn(async move {
            wait_for_shutdown(shutdown).await;
            drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });

        info!(%addr, "Edge HTTPS listener started");
        let app = edge_app(self.router.clone(), self.forwarder.clone(), true);
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|source| EdgeError::Bind { addr, source })?;
        info!(%addr, "Edge HTTPS listener stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use keel_certs::{parse_certificate, ChallengeResponder, LocalAuthority};
    use keel_placement::ReplicaSnapshot;
    use keel_types::{ChallengeType, HostId, ReplicaInstance, ReplicaState, RouteRule};
    use tower::ServiceExt;

    struct Fixture {
        router: Arc<EdgeRouter>,
        certs: Arc<CertStore>,
        responder: Arc<ChallengeResponder>,
        _replicas: watch::Sender<Arc<ReplicaSnapshot>>,
    }

    fn fixture(backends: &[&str]) -> Fixture {
        let replicas = backends
            .iter()
            .enumerate()
            .map(|(i, address)| {
                let mut r = ReplicaInstance::new("kibana", 1, i as u32, HostId::new("es01"), 0);
                r.address = Some(address.to_string());
                r.state = ReplicaState::Healthy;
                r
            })
            .collect();
        let (tx, rx) = watch::channel(Arc::new(ReplicaSnapshot { generation: 1, replicas }));
        let certs = Arc::new(CertStore::new());
        let responder = Arc::new(ChallengeResponder::new());
        Fixture {
            router: Arc::new(EdgeRouter::new(rx, certs.clone(), responder.clone())),
            certs,
            responder,
            _replicas: tx,
        }
    }

    fn app(router: &Arc<EdgeRouter>, secure: bool) -> Router {
        edge_app(router.clone(), Forwarder::new(&EdgeConfig::default()).unwrap(), secure)
            .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 7], 51000))))
    }

    fn get_request(host: &str, path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_host_is_404() {
        let f = fixture(&[]);
        let response = app(&f.router, false)
            .oneshot(get_request("nothing.example.com", "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_plaintext_redirects_to_https() {
        let f = fixture(&["127.0.0.1"]);
        f.router
            .set_rules(vec![RouteRule::new("kibana-labs.example.com", "kibana", 5601).https()])
            .unwrap();
        let response = app(&f.router, false)
            .oneshot(get_request("kibana-labs.example.com", "/app/home?x=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://kibana-labs.example.com/app/home?x=1"
        );
    }

    #[tokio::test]
    async fn test_tls_without_certificate_is_misdirected() {
        let f = fixture(&["127.0.0.1"]);
        f.router
            .set_rules(vec![RouteRule::new("kibana-labs.example.com", "kibana", 5601).https()])
            .unwrap();
        let response = app(&f.router, true)
            .oneshot(get_request("kibana-labs.example.com", "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
    }

    #[tokio::test]
    async fn test_no_backend_is_503() {
        let f = fixture(&[]);
        f.router
            .set_rules(vec![RouteRule::new("kibana.example.com", "kibana", 5601)])
            .unwrap();
        let response = app(&f.router, false)
            .oneshot(get_request("kibana.example.com", "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_serves_published_challenge() {
        let f = fixture(&[]);
        f.responder.publish("kibana-labs.example.com", "abc", "abc.thumb");
        let response = app(&f.router, false)
            .oneshot(get_request("kibana-labs.example.com", "/.well-known/acme-challenge/abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "abc.thumb");
    }

    #[tokio::test]
    async fn test_proxies_to_healthy_backend_once_certificate_exists() {
        let backend = Router::new().route(
            "/echo",
            get(|headers: HeaderMap| async move {
                let proto = headers
                    .get("x-forwarded-proto")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let forwarded_for = headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                format!("{} {}", proto, forwarded_for)
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        let f = fixture(&["127.0.0.1"]);
        f.router
            .set_rules(vec![RouteRule::new("kibana-labs.example.com", "kibana", port).https()])
            .unwrap();

        let refused = app(&f.router, true)
            .oneshot(get_request("kibana-labs.example.com", "/echo"))
            .await
            .unwrap();
        assert_eq!(refused.status(), StatusCode::MISDIRECTED_REQUEST);

        let authority = LocalAuthority::new("test-ca", f.responder.clone()).unwrap();
        let issued = authority.sign("kibana-labs.example.com").unwrap();
        f.certs.install(
            parse_certificate("kibana-labs.example.com", &issued.chain_pem, &issued.key_pem, ChallengeType::Http01)
                .unwrap(),
        );
        f.router.rebuild();

        let response = app(&f.router, true)
            .oneshot(get_request("kibana-labs.example.com", "/echo"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "https 203.0.113.7");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let f = fixture(&["127.0.0.1"]);
        f.router
            .set_rules(vec![RouteRule::new("kibana.example.com", "kibana", port)])
            .unwrap();
        let response = app(&f.router, false)
            .oneshot(get_request("kibana.example.com", "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
