//! Host and path dispatch for configured endpoints.
//!
//! Each listener owns a `RouteTable` built once from the configuration for
//! its scheme. Lookup tries the exact host bucket first and then the `*`
//! bucket; within a bucket the first registered prefix that matches wins.
//!
//! Request tracing is enabled via middleware that generates a unique request ID
//! for each incoming request, allowing correlation of all logs within a request.

pub mod proxy;
pub mod redirect;
pub mod run_command;
pub mod static_files;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::config::{Action, AppConfig, HttpsMode, WILDCARD_HOST};
use crate::middleware::request_id_layer;

use proxy::{ProxyClients, ProxyError, ReverseProxy};
use run_command::RunCommand;
use static_files::StaticFiles;

/// Which listener a table is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug)]
struct Route<H> {
    prefix: String,
    handler: H,
}

/// Host buckets of ordered `(prefix, handler)` pairs.
#[derive(Debug)]
pub struct RouteTable<H> {
    hosts: HashMap<String, Vec<Route<H>>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
        }
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, host: &str, prefix: &str, handler: H) {
        self.hosts.entry(host.to_string()).or_default().push(Route {
            prefix: prefix.to_string(),
            handler,
        });
    }

    pub fn route(&self, host: &str, path: &str) -> Option<&H> {
        Self::find(self.hosts.get(host), path)
            .or_else(|| Self::find(self.hosts.get(WILDCARD_HOST), path))
    }

    pub fn len(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find<'a>(routes: Option<&'a Vec<Route<H>>>, path: &str) -> Option<&'a H> {
        routes?
            .iter()
            .find(|route| path.starts_with(&route.prefix))
            .map(|route| &route.handler)
    }
}

/// Handler selected for an endpoint when the table is built.
pub enum EndpointHandler {
    RedirectToHttps { https_port: u16 },
    Redirect(String),
    Static(StaticFiles),
    Proxy(ReverseProxy),
    RunCommand(RunCommand),
}

impl fmt::Debug for EndpointHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RedirectToHttps { https_port } => f
                .debug_struct("RedirectToHttps")
                .field("https_port", https_port)
                .finish(),
            Self::Redirect(target) => f.debug_tuple("Redirect").field(target).finish(),
            Self::Static(files) => f.debug_tuple("Static").field(files).finish(),
            Self::Proxy(proxy) => f.debug_tuple("Proxy").field(proxy).finish(),
            Self::RunCommand(_) => f.write_str("RunCommand"),
        }
    }
}

impl EndpointHandler {
    pub async fn handle(&self, request: Request) -> Response {
        match self {
            Self::RedirectToHttps { https_port } => {
                let host = request_host(&request).unwrap_or_default();
                redirect::redirect_to_https(&host, request.uri(), *https_port)
            }
            Self::Redirect(target) => redirect::redirect(target),
            Self::Static(files) => files.serve(request).await,
            Self::Proxy(proxy) => match proxy.forward(request).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            },
            Self::RunCommand(command) => command.handle(request).await,
        }
    }
}

/// Build the dispatch table one listener serves.
///
/// Disabled endpoints produce no route. On the plaintext listener, endpoints
/// that have TLS and ask for it are replaced by a redirect to HTTPS.
pub fn build_table(
    config: &AppConfig,
    scheme: Scheme,
    proxies: &ProxyClients,
) -> Result<RouteTable<EndpointHandler>, ProxyError> {
    let mut table = RouteTable::new();

    for endpoint in config.enabled_endpoints() {
        let upgrade = scheme == Scheme::Http
            && endpoint.https != HttpsMode::None
            && endpoint.redirect_to_https;

        let handler = if upgrade {
            EndpointHandler::RedirectToHttps {
                https_port: config.ports.https,
            }
        } else {
            match &endpoint.action {
                Action::Redirect(target) => EndpointHandler::Redirect(target.clone()),
                Action::Static(action) => EndpointHandler::Static(StaticFiles::new(action)),
                Action::Proxy(action) => {
                    let client = proxies.client_for(&action.url)?;
                    EndpointHandler::Proxy(ReverseProxy::new(action, client, scheme))
                }
                Action::RunCommand(action) => EndpointHandler::RunCommand(RunCommand::new(action)),
            }
        };

        tracing::debug!(
            scheme = scheme.as_str(),
            endpoint = %endpoint.url,
            handler = ?handler,
            "Registered route"
        );
        table.add(&endpoint.url.host, &endpoint.url.path, handler);
    }

    Ok(table)
}

/// Creates the Axum router that dispatches every request through `table`.
pub fn create_router(table: Arc<RouteTable<EndpointHandler>>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(table)
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer))
}

async fn dispatch(
    State(table): State<Arc<RouteTable<EndpointHandler>>>,
    request: Request,
) -> Response {
    let host = request_host(&request).unwrap_or_default();
    match table.route(&host, request.uri().path()) {
        Some(handler) => handler.handle(request).await,
        None => status_response(StatusCode::NOT_FOUND),
    }
}

/// Plain-text response whose body is the status line, e.g. `404 Not Found`.
pub fn status_response(status: StatusCode) -> Response {
    (status, status.to_string()).into_response()
}

/// Lower-cased request host without port, from the URI authority or `Host`.
pub fn request_host(request: &Request) -> Option<String> {
    let raw = match request.uri().host() {
        Some(host) => host.to_string(),
        None => request
            .headers()
            .get(header::HOST)?
            .to_str()
            .ok()?
            .to_string(),
    };
    Some(strip_port(&raw).trim_end_matches('.').to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
