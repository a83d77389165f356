//! HTTP/HTTPS listener lifecycle.
//!
//! A `ServerSet` is built from one configuration generation and moves through
//! `Built → Running → Stopping → Stopped`. Every listener task reports exactly
//! one `ListenerExit` on a shared channel; the channel closes only after the
//! last task has reported, so a receiver never races a late send.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use futures::StreamExt;
use rustls_acme::AcmeState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::routes::proxy::{ProxyClients, ProxyError};
use crate::routes::{build_table, create_router, Scheme};
use crate::tls::{self, CacheError, CertError, TlsAcceptor};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Listener {addr} failed: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to configure TLS: {0}")]
    Tls(#[from] CertError),

    #[error("Failed to build routes: {0}")]
    Routes(#[from] ProxyError),

    #[error("Server set is {0:?}, cannot {1}")]
    InvalidState(ServerState, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Built,
    Running,
    Stopping,
    Stopped,
}

/// Terminal report of one listener task.
#[derive(Debug)]
pub enum ListenerExit {
    /// The listener was shut down.
    Closed { addr: SocketAddr },
    Failed(ServerError),
}

struct PendingListener {
    scheme: Scheme,
    addr: SocketAddr,
    app: Router,
    tls: Option<TlsAcceptor>,
}

struct RunningListener {
    scheme: Scheme,
    addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<()>,
}

/// The listeners serving one configuration generation.
pub struct ServerSet {
    state: ServerState,
    shutdown_timeout: Duration,
    pending: Vec<PendingListener>,
    running: Vec<RunningListener>,
    acme_state: Option<AcmeState<CacheError, CacheError>>,
    acme_task: Option<JoinHandle<()>>,
    exits: Option<mpsc::UnboundedReceiver<ListenerExit>>,
    proxies: ProxyClients,
}

impl std::fmt::Debug for ServerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSet")
            .field("state", &self.state)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("addrs", &self.local_addrs())
            .field("acme", &self.acme_task.is_some())
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

impl ServerSet {
    /// Build routers and TLS for `config`. Nothing is bound until `start`.
    ///
    /// The HTTP listener is always present; the HTTPS listener only when an
    /// enabled endpoint requires TLS.
    pub fn new(config: &AppConfig, shutdown_timeout: Duration) -> Result<Self, ServerError> {
        let proxies = ProxyClients::new();
        let mut pending = Vec::with_capacity(2);
        let mut acme_state = None;

        let http_table = build_table(config, Scheme::Http, &proxies)?;
        pending.push(PendingListener {
            scheme: Scheme::Http,
            addr: SocketAddr::from(([0, 0, 0, 0], config.ports.http)),
            app: create_router(Arc::new(http_table)),
            tls: None,
        });

        if config.uses_https() {
            let setup = tls::configure(config)?;
            let https_table = build_table(config, Scheme::Https, &proxies)?;
            pending.push(PendingListener {
                scheme: Scheme::Https,
                addr: SocketAddr::from(([0, 0, 0, 0], config.ports.https)),
                app: create_router(Arc::new(https_table)),
                tls: Some(setup.acceptor),
            });
            acme_state = setup.acme_state;
        }

        Ok(Self {
            state: ServerState::Built,
            shutdown_timeout,
            pending,
            running: Vec::new(),
            acme_state,
            acme_task: None,
            exits: None,
            proxies,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bind every listener, then spawn one serving task per listener.
    ///
    /// Returns once all tasks are scheduled, without waiting for them to
    /// accept. A bind failure leaves the set `Stopped` with nothing running.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Built {
            return Err(ServerError::InvalidState(self.state, "start"));
        }

        let mut bound = Vec::with_capacity(self.pending.len());
        for listener in self.pending.drain(..) {
            match bind(listener.addr) {
                Ok(tcp) => bound.push((listener, tcp)),
                Err(e) => {
                    self.state = ServerState::Stopped;
                    self.acme_state = None;
                    return Err(e);
                }
            }
        }

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        for (listener, tcp) in bound {
            let addr = tcp.local_addr().unwrap_or(listener.addr);
            let handle = Handle::new();
            tracing::info!(scheme = listener.scheme.as_str(), %addr, "Starting listener");

            let task = tokio::spawn(serve(
                tcp,
                addr,
                listener.app,
                listener.tls,
                handle.clone(),
                exit_tx.clone(),
            ));
            self.running.push(RunningListener {
                scheme: listener.scheme,
                addr,
                handle,
                task,
            });
        }
        // Only listener tasks hold senders from here on.
        drop(exit_tx);

        if let Some(state) = self.acme_state.take() {
            self.acme_task = Some(tokio::spawn(drive_acme(state)));
        }

        self.exits = Some(exit_rx);
        self.state = ServerState::Running;
        Ok(())
    }

    /// Gracefully shut down all listeners, bounded by the shutdown timeout.
    ///
    /// Connections still open at the deadline are closed. Returns after every
    /// listener task has finished. Stopping twice is a no-op; stopping a set
    /// that was never started is an error.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        match self.state {
            ServerState::Built => return Err(ServerError::InvalidState(self.state, "stop")),
            ServerState::Stopping | ServerState::Stopped => return Ok(()),
            ServerState::Running => {}
        }
        self.state = ServerState::Stopping;

        tracing::info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            listeners = self.running.len(),
            "Stopping listeners"
        );

        for listener in &self.running {
            listener.handle.graceful_shutdown(Some(self.shutdown_timeout));
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let joins = self.running.drain(..).map(|mut listener| async move {
            let joined = match tokio::time::timeout_at(deadline, &mut listener.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(addr = %listener.addr, "Listener did not drain in time, closing");
                    listener.handle.shutdown();
                    (&mut listener.task).await
                }
            };
            if let Err(e) = joined {
                tracing::error!(addr = %listener.addr, error = %e, "Listener task failed");
            }
        });
        futures::future::join_all(joins).await;

        if let Some(task) = self.acme_task.take() {
            task.abort();
            let _ = task.await;
        }

        self.state = ServerState::Stopped;
        tracing::info!("All listeners stopped");
        Ok(())
    }

    /// Next listener exit; `None` once every listener task has reported.
    pub async fn next_exit(&mut self) -> Option<ListenerExit> {
        match self.exits.as_mut() {
            Some(exits) => exits.recv().await,
            None => None,
        }
    }

    /// Addresses actually bound, in start order (HTTP first).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running.iter().map(|l| l.addr).collect()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.addr_for(Scheme::Http)
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.addr_for(Scheme::Https)
    }

    fn addr_for(&self, scheme: Scheme) -> Option<SocketAddr> {
        self.running
            .iter()
            .find(|l| l.scheme == scheme)
            .map(|l| l.addr)
    }
}

impl Drop for ServerSet {
    fn drop(&mut self) {
        for listener in &self.running {
            listener.handle.shutdown();
        }
        if let Some(task) = &self.acme_task {
            task.abort();
        }
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ServerError::Bind { addr, source })?;
    Ok(listener)
}

async fn serve(
    tcp: TcpListener,
    addr: SocketAddr,
    app: Router,
    tls: Option<TlsAcceptor>,
    handle: Handle,
    exits: mpsc::UnboundedSender<ListenerExit>,
) {
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let result = match tls {
        None => axum_server::from_tcp(tcp).handle(handle).serve(service).await,
        Some(TlsAcceptor::Rustls(config)) => {
            axum_server::from_tcp_rustls(tcp, config)
                .handle(handle)
                .serve(service)
                .await
        }
        Some(TlsAcceptor::Acme(acceptor)) => {
            axum_server::from_tcp(tcp)
                .acceptor(acceptor)
                .handle(handle)
                .serve(service)
                .await
        }
    };

    let exit = match result {
        Ok(()) => {
            tracing::debug!(%addr, "Listener closed");
            ListenerExit::Closed { addr }
        }
        Err(source) => ListenerExit::Failed(ServerError::Listener { addr, source }),
    };
    // The receiver may already be gone when the set was dropped.
    let _ = exits.send(exit);
}

/// Poll the ACME state so certificates are ordered and renewed.
async fn drive_acme(mut state: AcmeState<CacheError, CacheError>) {
    loop {
        match state.next().await {
            Some(Ok(event)) => {
                tracing::info!(event = ?event, "ACME event");
            }
            Some(Err(err)) => {
                tracing::error!(error = %err, "ACME error");
            }
            None => {
                tracing::debug!("ACME state stream ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(yaml: &str) -> AppConfig {
        AppConfig::from_yaml(yaml, Path::new("/tmp")).unwrap()
    }

    const PLAIN: &str = r#"
ports: { http: 0, https: 0 }
endpoints:
  - url: localhost
    redirect: https://example.com
"#;

    #[test]
    fn test_https_listener_only_when_needed() {
        let set = ServerSet::new(&config(PLAIN), Duration::from_secs(1)).unwrap();
        assert_eq!(set.pending.len(), 1);
        assert_eq!(set.state(), ServerState::Built);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_error() {
        let mut set = ServerSet::new(&config(PLAIN), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            set.stop().await,
            Err(ServerError::InvalidState(ServerState::Built, "stop"))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_error() {
        let mut set = ServerSet::new(&config(PLAIN), Duration::from_secs(1)).unwrap();
        set.start().unwrap();
        assert!(matches!(
            set.start(),
            Err(ServerError::InvalidState(ServerState::Running, "start"))
        ));
        set.stop().await.unwrap();
        set.stop().await.unwrap();
        assert_eq!(set.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let taken = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let yaml = format!(
            "ports: {{ http: {port} }}\nendpoints:\n  - url: localhost\n    redirect: /x\n"
        );

        let mut set = ServerSet::new(&config(&yaml), Duration::from_secs(1)).unwrap();
        let err = set.start().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(set.state(), ServerState::Stopped);
        assert!(set.next_exit().await.is_none());
    }
}
