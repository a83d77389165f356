//! Self-signed fallback identities.
//!
//! Generated on first use per host and persisted in the certificate cache as
//! the PEM private key followed by the PEM certificate. Cached material is
//! reused verbatim until its `notAfter` has passed.

use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::sign::CertifiedKey;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::cache::JsonFileCache;
use super::CertError;

/// Backdating covers clients with skewed clocks.
const VALIDITY_BACKDATE: Duration = Duration::days(30);

/// Ten years.
const VALIDITY_PERIOD: Duration = Duration::days(3652);

/// An identity loaded or generated for one host.
#[derive(Clone, Debug)]
pub struct Issued {
    pub key: Arc<CertifiedKey>,
    pub not_after: OffsetDateTime,
}

impl Issued {
    fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.not_after
    }
}

/// Produces or retrieves self-signed identities, persisting them in the cache.
pub struct SelfSignedCerts {
    cache: JsonFileCache,
    issued: moka::sync::Cache<String, Issued>,
}

impl std::fmt::Debug for SelfSignedCerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCerts")
            .field("cache", &self.cache.path())
            .field("issued", &self.issued.entry_count())
            .finish()
    }
}

impl SelfSignedCerts {
    pub fn new(cache: JsonFileCache) -> Self {
        Self {
            cache,
            issued: moka::sync::Cache::builder().max_capacity(1024).build(),
        }
    }

    /// Certificate for an already-normalized host name.
    ///
    /// Concurrent callers for the same host share a single load or generation.
    pub fn certificate_for(&self, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
        if let Some(issued) = self.issued.get(host) {
            if !issued.is_expired() {
                return Ok(issued.key);
            }
            self.issued.invalidate(host);
        }

        self.issued
            .try_get_with(host.to_string(), || self.load_or_generate(host))
            .map(|issued| issued.key)
            .map_err(|source| CertError::SelfSigned {
                host: host.to_string(),
                source,
            })
    }

    fn load_or_generate(&self, host: &str) -> Result<Issued, CertError> {
        if let Some(blob) = self.cache.get(host)? {
            match parse_identity(&blob) {
                Ok(issued) if !issued.is_expired() => {
                    tracing::debug!(host = %host, "Reusing cached self-signed certificate");
                    return Ok(issued);
                }
                Ok(issued) => {
                    tracing::info!(
                        host = %host,
                        not_after = %issued.not_after,
                        "Cached self-signed certificate expired, regenerating"
                    );
                }
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "Discarding unreadable cached certificate");
                    self.cache.delete(host)?;
                }
            }
        }

        let blob = generate(host)?;
        self.cache.put(host, blob.as_bytes())?;
        tracing::info!(host = %host, "Generated self-signed certificate");
        parse_identity(blob.as_bytes())
    }
}

/// Fresh P-256 key and certificate for `host`, PEM-encoded key then certificate.
pub fn generate(host: &str) -> Result<String, CertError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::new(vec![host.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - VALIDITY_BACKDATE;
    params.not_after = now + VALIDITY_PERIOD;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.self_signed(&key_pair)?;

    let mut blob = key_pair.serialize_pem();
    blob.push_str(&cert.pem());
    Ok(blob)
}

/// Parse a cached key+certificate blob into a rustls identity.
pub fn parse_identity(blob: &[u8]) -> Result<Issued, CertError> {
    let key = PrivateKeyDer::from_pem_slice(blob)
        .map_err(|e| CertError::Parse(format!("private key: {}", e)))?;
    let certs = CertificateDer::pem_slice_iter(blob)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse(format!("certificate: {}", e)))?;
    let leaf = certs
        .first()
        .ok_or_else(|| CertError::Parse("no certificate in blob".to_string()))?;

    let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| CertError::Parse(e.to_string()))?;
    let not_after = parsed.validity().not_after.to_datetime();

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;
    Ok(Issued {
        key: Arc::new(CertifiedKey::new(certs, signing_key)),
        not_after,
    })
}
