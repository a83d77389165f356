//! Single-target reverse proxy.
//!
//! Requests are forwarded with their method, query, body and end-to-end
//! headers to the configured upstream. The upstream response is streamed back.
//! Clients are shared per upstream URL within one server generation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::config::ProxyAction;

use super::{status_response, Scheme};

/// Headers that apply to a single connection and must not be forwarded.
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to build proxy client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("upstream request to {url} failed: {source}")]
    Upstream {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Proxy request failed");
        status_response(StatusCode::BAD_GATEWAY)
    }
}

/// Upstream clients keyed by canonical target URL, rebuilt with each
/// server generation.
#[derive(Debug, Clone, Default)]
pub struct ProxyClients {
    clients: Arc<Mutex<HashMap<String, reqwest::Client>>>,
}

impl ProxyClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_for(&self, target: &Url) -> Result<reqwest::Client, ProxyError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(target.as_str()) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::Client)?;
        clients.insert(target.as_str().to_string(), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
    target: Url,
    remove_prefix: Option<String>,
    scheme: Scheme,
}

impl ReverseProxy {
    pub fn new(action: &ProxyAction, client: reqwest::Client, scheme: Scheme) -> Self {
        Self {
            client,
            target: action.url.clone(),
            remove_prefix: action.remove_prefix.clone(),
            scheme,
        }
    }

    pub async fn forward(&self, request: Request) -> Result<Response, ProxyError> {
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let (parts, body) = request.into_parts();
        let url = self.upstream_url(&parts.uri);

        let mut headers = parts.headers;
        let original_host = headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);

        if let Some(ip) = client_ip {
            let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, ip),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = original_host.or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        }) {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(self.scheme.as_str()),
        );

        // Streamed as it arrives; an empty body stays empty so bodiless
        // requests are not sent chunked.
        let body = if body.size_hint().exact() == Some(0) {
            reqwest::Body::from(Vec::new())
        } else {
            reqwest::Body::wrap_stream(body.into_data_stream())
        };

        tracing::debug!(method = %parts.method, upstream = %url, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method, url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|source| ProxyError::Upstream { url, source })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    /// Upstream URL for a request: prefix removed, then joined onto the target
    /// path with exactly one slash; queries are concatenated.
    fn upstream_url(&self, uri: &Uri) -> Url {
        let mut path = uri.path();
        if let Some(prefix) = &self.remove_prefix {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                path = rest;
            }
        }

        let mut url = self.target.clone();
        url.set_path(&join_paths(self.target.path(), path));

        let query = match (self.target.query(), uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };
        url.set_query(query.as_deref());
        url
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::any;
    use axum::Router;

    fn proxy(target: &str, remove_prefix: Option<&str>) -> ReverseProxy {
        let action = ProxyAction {
            url: Url::parse(target).unwrap(),
            remove_prefix: remove_prefix.map(str::to_string),
        };
        ReverseProxy::new(&action, reqwest::Client::new(), Scheme::Http)
    }

    fn upstream(proxy: &ReverseProxy, uri: &str) -> String {
        proxy.upstream_url(&uri.parse().unwrap()).to_string()
    }

    #[test]
    fn test_upstream_url_joins_paths() {
        let root = proxy("http://backend:3000", None);
        assert_eq!(upstream(&root, "/a/b?x=1"), "http://backend:3000/a/b?x=1");

        let based = proxy("http://backend:3000/base?k=v", None);
        assert_eq!(upstream(&based, "/a?x=1"), "http://backend:3000/base/a?k=v&x=1");
    }

    #[test]
    fn test_upstream_url_removes_prefix() {
        let api = proxy("http://backend:3000", Some("/api"));
        assert_eq!(upstream(&api, "/api/users"), "http://backend:3000/users");
        assert_eq!(upstream(&api, "/api"), "http://backend:3000/");
        assert_eq!(upstream(&api, "/other"), "http://backend:3000/other");
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_clients_cached_per_target() {
        let clients = ProxyClients::new();
        let a = Url::parse("http://a.internal/").unwrap();
        let b = Url::parse("http://b.internal/").unwrap();
        clients.client_for(&a).unwrap();
        clients.client_for(&a).unwrap();
        clients.client_for(&b).unwrap();
        assert_eq!(clients.len(), 2);
    }

    #[tokio::test]
    async fn test_forwards_to_upstream() {
        let backend = Router::new().fallback(any(|request: Request| async move {
            let proto = request.headers()[&X_FORWARDED_PROTO].to_str().unwrap().to_string();
            let host = request.headers()[&X_FORWARDED_HOST].to_str().unwrap().to_string();
            format!("{} {} {}", request.uri(), proto, host)
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, backend).await });

        let proxy = proxy(&format!("http://{}", addr), Some("/api"));
        let request = Request::builder()
            .uri("/api/items?page=2")
            .header(header::HOST, "front.example")
            .body(Body::empty())
            .unwrap();
        let response = proxy.forward(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"/items?page=2 http front.example");
    }

    #[tokio::test]
    async fn test_streams_request_body_upstream() {
        let backend = Router::new().fallback(any(|request: Request| async move {
            let chunked = request.headers().contains_key(header::TRANSFER_ENCODING);
            let body = axum::body::to_bytes(request.into_body(), 1 << 20).await.unwrap();
            format!("{} {}", body.len(), chunked)
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, backend).await });
        let proxy = proxy(&format!("http://{}", addr), None);

        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            (0..4).map(|_| Ok(vec![b'x'; 64 * 1024])).collect();
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
        let response = proxy.forward(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"262144 true");

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = proxy.forward(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"0 false");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = proxy(&format!("http://{}", addr), None);
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = proxy.forward(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream { .. }));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
