//! Handshake-time certificate selection.
//!
//! The ACME manager is consulted first. When it cannot produce a certificate
//! for the requested name and that name is configured for self-signed TLS,
//! the self-signed generator supplies one instead. Any other failure aborts
//! only the handshake.

use std::collections::HashSet;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_acme::ResolvesServerCertAcme;

use crate::config::normalize_host;

use super::self_signed::SelfSignedCerts;
use super::CertError;

/// ACME-backed lookup restricted to a host whitelist.
#[derive(Debug)]
pub struct AcmeManager {
    hosts: HashSet<String>,
    resolver: Arc<ResolvesServerCertAcme>,
}

impl AcmeManager {
    pub fn new<I: IntoIterator<Item = String>>(
        hosts: I,
        resolver: Arc<ResolvesServerCertAcme>,
    ) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| normalize_host(&host).unwrap_or(host))
                .collect(),
            resolver,
        }
    }

    /// Normalized form of `server_name` if it is on the whitelist.
    fn allows(&self, server_name: Option<&str>) -> Result<String, CertError> {
        let name = server_name.ok_or(CertError::MissingServerName)?;
        normalize_host(name)
            .filter(|host| self.hosts.contains(host))
            .ok_or_else(|| CertError::HostNotAllowed(name.to_string()))
    }

    /// rustls-acme hands out its one certificate for any name, so the
    /// whitelist is checked before `lookup` runs.
    fn certificate_for<L>(
        &self,
        server_name: Option<&str>,
        lookup: L,
    ) -> Result<Arc<CertifiedKey>, CertError>
    where
        L: FnOnce(&ResolvesServerCertAcme) -> Option<Arc<CertifiedKey>>,
    {
        let host = self.allows(server_name)?;
        lookup(&self.resolver).ok_or(CertError::NotIssued(host))
    }
}

/// Certificate resolver installed in the HTTPS listener's rustls config.
#[derive(Debug)]
pub struct CertResolver {
    acme: Option<AcmeManager>,
    self_signed: SelfSignedCerts,
    self_hosts: HashSet<String>,
}

impl CertResolver {
    pub fn new<I: IntoIterator<Item = String>>(
        acme: Option<AcmeManager>,
        self_signed: SelfSignedCerts,
        self_hosts: I,
    ) -> Self {
        let self_hosts = self_hosts
            .into_iter()
            .map(|host| normalize_host(&host).unwrap_or(host))
            .collect();
        Self {
            acme,
            self_signed,
            self_hosts,
        }
    }

    /// Load or generate every self-signed identity up front, so handshakes
    /// do not touch the cache file. Failures are retried at handshake time.
    pub fn warm_self_signed(&self) {
        for host in &self.self_hosts {
            if let Err(e) = self.self_signed.certificate_for(host) {
                tracing::warn!(host = %host, error = %e, "Self-signed certificate not ready");
            }
        }
    }

    /// Resolve by name alone, without an ACME-capable ClientHello.
    pub fn resolve_server_name(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertError> {
        self.resolve_name(server_name, |_| None)
    }

    fn resolve_name<L>(
        &self,
        server_name: Option<&str>,
        lookup: L,
    ) -> Result<Arc<CertifiedKey>, CertError>
    where
        L: FnOnce(&ResolvesServerCertAcme) -> Option<Arc<CertifiedKey>>,
    {
        self.resolve_with(server_name, || match &self.acme {
            Some(acme) => acme.certificate_for(server_name, lookup),
            None => Err(match server_name {
                Some(name) => CertError::HostNotAllowed(name.to_string()),
                None => CertError::MissingServerName,
            }),
        })
    }

    fn resolve_with<F>(
        &self,
        server_name: Option<&str>,
        acme_lookup: F,
    ) -> Result<Arc<CertifiedKey>, CertError>
    where
        F: FnOnce() -> Result<Arc<CertifiedKey>, CertError>,
    {
        let acme_err = match acme_lookup() {
            Ok(key) => return Ok(key),
            Err(e) => e,
        };

        let Some(name) = server_name.and_then(normalize_host) else {
            return Err(acme_err);
        };
        if !self.self_hosts.contains(&name) {
            return Err(acme_err);
        }

        self.self_signed.certificate_for(&name)
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().map(str::to_owned);
        let result =
            self.resolve_name(server_name.as_deref(), |acme| acme.resolve(client_hello));

        match result {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(
                    server_name = server_name.as_deref().unwrap_or("<none>"),
                    error = %e,
                    "TLS certificate resolution failed"
                );
                None
            }
        }
    }
}
