//! Upstream forwarding
//!
//! Requests are forwarded to one replica endpoint over plain HTTP. The
//! request body is buffered up to `max_body_bytes`; the response body is
//! streamed back as it arrives.

use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Uri};
use axum::response::Response;
use futures::TryStreamExt;
use std::net::SocketAddr;
use tracing::debug;

/// Headers that describe one connection, never forwarded
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Where a proxied request came from
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub peer: SocketAddr,
    /// Host as the client sent it
    pub host: String,
    pub secure: bool,
}

/// One request to forward
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP client for replica endpoints
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl Forwarder {
    pub fn new(config: &EdgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.proxy_timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| EdgeError::Proxy(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Forward `request` to `endpoint` (`address:port`)
    pub async fn forward(
        &self,
        endpoint: &str,
        request: UpstreamRequest,
        client: &ClientInfo,
    ) -> Result<Response> {
        let path = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", endpoint, path);
        let headers = upstream_headers(&request.headers, client);

        debug!(%url, method = %request.method, "Forwarding request");
        let upstream = self
            .client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| EdgeError::Proxy(format!("{}: {}", endpoint, e)))?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }

        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        response
            .body(Body::from_stream(stream))
            .map_err(|e| EdgeError::Proxy(format!("Failed to build response: {}", e)))
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// Request headers as sent upstream: hop-by-hop and `host` dropped,
/// forwarding headers set.
pub fn upstream_headers(incoming: &HeaderMap, client: &ClientInfo) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 3);
    for (name, value) in incoming {
        if !is_hop_by_hop(name) && name != header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let peer = client.peer.ip().to_string();
    let forwarded_for = match incoming.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(chain) if !chain.is_empty() => format!("{}, {}", chain, peer),
        _ => peer,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if client.secure { "https" } else { "http" }),
    );
    if let Ok(value) = HeaderValue::from_str(&client.host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers
}
