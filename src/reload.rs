//! Configuration reload loop.
//!
//! Each iteration loads the configuration, starts a `ServerSet` for it and
//! waits for one decisive event: a change to the configuration file (reload)
//! or an interrupt (stop). Listener failures are logged while waiting but
//! never end the wait on their own. The running set is always fully stopped
//! before the next one binds.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::http::{ListenerExit, ServerSet};
use crate::logging::LogControl;

/// Editors often write a file in several steps; events inside this window
/// collapse into one reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

type WatchEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// What ends one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reload,
    Stop,
}

pub struct ReloadController {
    config_path: PathBuf,
    shutdown_timeout: Duration,
    logging: Option<LogControl>,
}

impl ReloadController {
    pub fn new<P: Into<PathBuf>>(config_path: P, shutdown_timeout: Duration) -> Self {
        Self {
            config_path: config_path.into(),
            shutdown_timeout,
            logging: None,
        }
    }

    /// Apply each loaded configuration's log settings through `logging`.
    pub fn with_logging(mut self, logging: LogControl) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Serve until `interrupt` resolves.
    ///
    /// An invalid configuration is logged and the loop waits for the next
    /// change with nothing running. A listener that cannot bind ends the loop
    /// with an error.
    pub async fn run<F>(self, interrupt: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let _watcher = watch(&self.config_path, events_tx)?;
        tokio::pin!(interrupt);

        loop {
            let mut servers = self.start_generation()?;

            let outcome = wait(
                interrupt.as_mut(),
                &mut events,
                servers.as_mut(),
                &self.config_path,
            )
            .await;

            if let Some(mut servers) = servers {
                servers.stop().await?;
            }

            match outcome {
                Outcome::Stop => {
                    tracing::info!("Shutdown complete");
                    return Ok(());
                }
                Outcome::Reload => {
                    tracing::info!(path = %self.config_path.display(), "Reloading configuration");
                }
            }
        }
    }

    fn start_generation(&self) -> Result<Option<ServerSet>, AppError> {
        let config = match AppConfig::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load configuration, waiting for changes"
                );
                return Ok(None);
            }
        };

        if let Some(logging) = &self.logging {
            if let Err(e) = logging.apply(&config) {
                tracing::warn!(error = %e, "Failed to apply logging configuration");
            }
        }

        tracing::info!(
            endpoints = config.endpoints.len(),
            hosts = ?config.hosts(),
            http_port = config.ports.http,
            https_port = config.ports.https,
            "Loaded configuration"
        );

        let mut servers = match ServerSet::new(&config, self.shutdown_timeout) {
            Ok(servers) => servers,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build servers, waiting for changes");
                return Ok(None);
            }
        };
        servers.start()?;
        tracing::info!(addrs = ?servers.local_addrs(), "Servers started");
        Ok(Some(servers))
    }
}

/// Watch the configuration file's directory, so replacing the file by
/// rename is observed as well as writing it in place.
fn watch(
    config_path: &Path,
    events: mpsc::UnboundedSender<notify::Result<Event>>,
) -> Result<RecommendedWatcher, AppError> {
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        // The receiver is gone once the loop has returned.
        let _ = events.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    tracing::info!(dir = %dir.display(), "Watching for configuration changes");
    Ok(watcher)
}

/// Block until the next decisive event.
async fn wait<F>(
    mut interrupt: Pin<&mut F>,
    events: &mut WatchEvents,
    mut servers: Option<&mut ServerSet>,
    config_path: &Path,
) -> Outcome
where
    F: Future<Output = ()>,
{
    let mut watching = true;
    let mut serving = servers.is_some();

    loop {
        tokio::select! {
            _ = &mut interrupt => return Outcome::Stop,

            event = events.recv(), if watching => match event {
                Some(Ok(event)) => {
                    if is_config_change(&event, config_path) {
                        tracing::info!(kind = ?event.kind, "Configuration file changed");
                        drain(events).await;
                        return Outcome::Reload;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Configuration watcher error");
                    return Outcome::Reload;
                }
                None => watching = false,
            },

            exit = next_exit(&mut servers), if serving => match exit {
                Some(ListenerExit::Closed { addr }) => {
                    tracing::info!(%addr, "Listener closed");
                }
                Some(ListenerExit::Failed(e)) => {
                    tracing::error!(error = %e, "Listener failed");
                }
                None => serving = false,
            },
        }
    }
}

async fn next_exit(servers: &mut Option<&mut ServerSet>) -> Option<ListenerExit> {
    match servers {
        Some(servers) => servers.next_exit().await,
        None => None,
    }
}

fn is_config_change(event: &Event, config_path: &Path) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    let Some(name) = config_path.file_name() else {
        return false;
    };
    event.paths.iter().any(|path| path.file_name() == Some(name))
}

/// Discard events that arrive within the debounce window.
async fn drain(events: &mut WatchEvents) {
    let deadline = tokio::time::Instant::now() + DEBOUNCE;
    while let Ok(Some(_)) = tokio::time::timeout_at(deadline, events.recv()).await {}
}
