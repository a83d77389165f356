//! TLS termination for the HTTPS listener.
//!
//! This module provides certificate management with two sources:
//! - **ACME**: Automatic certificate provisioning via Let's Encrypt (TLS-ALPN-01)
//! - **Self-signed**: Locally generated fallback identities for configured hosts
//!
//! Both persist their material in one JSON file cache. A fresh cache and
//! resolver are built for every configuration generation.

pub mod cache;
pub mod resolver;
pub mod self_signed;

use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use rustls_acme::axum::AxumAcceptor;
use rustls_acme::{AcmeConfig, AcmeState};

use crate::config::AppConfig;

pub use cache::{CacheError, JsonFileCache};
pub use resolver::{AcmeManager, CertResolver};
pub use self_signed::SelfSignedCerts;

/// Certificate resolution failure, scoped to a single handshake.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("client did not send a server name")]
    MissingServerName,

    #[error("host '{0}' is not eligible for a certificate")]
    HostNotAllowed(String),

    #[error("no ACME certificate issued yet for '{0}'")]
    NotIssued(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid certificate material: {0}")]
    Parse(String),

    #[error("unusable private key: {0}")]
    Key(#[from] rustls::Error),

    #[error("self-signed certificate for '{host}': {source}")]
    SelfSigned {
        host: String,
        #[source]
        source: Arc<CertError>,
    },
}

/// How the HTTPS listener accepts connections.
pub enum TlsAcceptor {
    /// ACME challenge connections are answered, the rest use our config.
    Acme(AxumAcceptor),
    Rustls(RustlsConfig),
}

/// TLS pieces for one configuration generation.
pub struct TlsSetup {
    pub acceptor: TlsAcceptor,
    /// Drives issuance and renewal; must be polled while the listener runs.
    pub acme_state: Option<AcmeState<CacheError, CacheError>>,
}

/// Build the HTTPS acceptor and certificate resolver for `config`.
pub fn configure(config: &AppConfig) -> Result<TlsSetup, CertError> {
    let cache = JsonFileCache::new(&config.certs_file);
    let acme_hosts = config.acme_hosts();
    let self_hosts = config.self_hosts();

    tracing::info!(
        acme_hosts = ?acme_hosts,
        self_hosts = ?self_hosts,
        cache = %config.certs_file.display(),
        "Configuring TLS"
    );

    let acme_state = if acme_hosts.is_empty() {
        None
    } else {
        Some(
            AcmeConfig::new(acme_hosts.clone())
                .cache(cache.clone())
                .directory_lets_encrypt(true)
                .state(),
        )
    };

    let acme = acme_state
        .as_ref()
        .map(|state| AcmeManager::new(acme_hosts, state.resolver()));
    let resolver = CertResolver::new(acme, SelfSignedCerts::new(cache), self_hosts);
    resolver.warm_self_signed();
    let server_config = Arc::new(server_config(Arc::new(resolver))?);

    let acceptor = match &acme_state {
        Some(state) => TlsAcceptor::Acme(state.axum_acceptor(server_config)),
        None => TlsAcceptor::Rustls(RustlsConfig::from_config(server_config)),
    };

    Ok(TlsSetup {
        acceptor,
        acme_state,
    })
}

fn server_config(resolver: Arc<CertResolver>) -> Result<ServerConfig, CertError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
