//! Configuration loading and constants.
//!
//! Loads the server configuration from a YAML file, normalizes endpoint URLs
//! and validates that every endpoint carries exactly one action. `AppConfig`
//! is immutable once loaded; a reload always produces a fresh value.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

// =============================================================================
// Defaults
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Default plaintext port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default TLS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Default log file, relative to the configuration file
pub const DEFAULT_LOG_FILE: &str = "portico.log";

/// Default certificate cache file, relative to the configuration file
pub const DEFAULT_CERTS_FILE: &str = "certs.json";

/// Default index file for static directories
pub const DEFAULT_INDEX: &str = "index.html";

/// Default not-found page for static directories
pub const DEFAULT_NOT_FOUND: &str = "404.html";

/// Log file value that disables the file sink
pub const NULL_LOG_FILE: &str = "/dev/null";

/// Default log filter before any configuration has been loaded
pub const DEFAULT_LOG_FILTER: &str = "portico=info,tower_http=info";

/// Bounded wait for listeners to drain during shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Host bucket holding routes tried after the exact host lookup fails
pub const WILDCARD_HOST: &str = "*";

// =============================================================================
// Validated configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub ports: Ports,
    pub log_file: PathBuf,
    pub certs_file: PathBuf,
    pub log_level: LogLevel,
    /// Endpoints in file order; order is routing precedence within a host.
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Ports {
    #[serde(default = "Ports::default_http")]
    pub http: u16,
    #[serde(default = "Ports::default_https")]
    pub https: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            http: Self::default_http(),
            https: Self::default_https(),
        }
    }
}

impl Ports {
    fn default_http() -> u16 {
        DEFAULT_HTTP_PORT
    }

    fn default_https() -> u16 {
        DEFAULT_HTTPS_PORT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// How an endpoint's host obtains its TLS identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsMode {
    None,
    Acme,
    SelfSigned,
}

impl HttpsMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "acme" => Some(Self::Acme),
            "self" => Some(Self::SelfSigned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: EndpointUrl,
    pub https: HttpsMode,
    pub redirect_to_https: bool,
    pub enabled: bool,
    pub action: Action,
}

/// Host and path prefix an endpoint is mounted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    /// ASCII (punycode) lower-case host, or `*`
    pub host: String,
    pub path: String,
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

impl EndpointUrl {
    /// Parse `[scheme://]host[:port][/path]`. The port is not part of routing.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);

        let (authority, path) = match without_scheme.find('/') {
            Some(idx) => without_scheme.split_at(idx),
            None => (without_scheme, "/"),
        };

        let host = if let Some(rest) = authority.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| {
                ConfigError::Validation(format!("invalid endpoint url '{}'", raw))
            })?;
            &authority[..end + 2]
        } else {
            authority.split(':').next().unwrap_or(authority)
        };

        let host = if host == WILDCARD_HOST {
            WILDCARD_HOST.to_string()
        } else {
            normalize_host(host).ok_or_else(|| {
                ConfigError::Validation(format!("invalid host in endpoint url '{}'", raw))
            })?
        };

        let path = path.split(['?', '#']).next().unwrap_or("/");
        let path = if path.is_empty() { "/" } else { path };

        Ok(Self {
            host,
            path: path.to_string(),
        })
    }
}

/// Normalize a host name to lower-case ASCII (IDNA). Returns `None` when the
/// name cannot be represented.
pub fn normalize_host(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.');
    if name.is_empty() {
        return None;
    }
    url::Host::parse(&name.to_lowercase())
        .ok()
        .map(|host| host.to_string())
}

/// The single action an endpoint performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Redirect(String),
    Static(StaticAction),
    Proxy(ProxyAction),
    RunCommand(RunCommandAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAction {
    pub dir: PathBuf,
    pub index: String,
    pub not_found: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAction {
    pub url: Url,
    pub remove_prefix: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RunCommandAction {
    pub token: String,
    pub command: Vec<String>,
}

impl fmt::Debug for RunCommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCommandAction")
            .field("token", &"<redacted>")
            .field("command", &self.command)
            .finish()
    }
}

// =============================================================================
// File representation
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    ports: Ports,
    log_file: Option<String>,
    certs_file: Option<String>,
    log_level: Option<String>,
    #[serde(default)]
    endpoints: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEndpoint {
    url: String,
    #[serde(default)]
    https: String,
    redirect_to_https: Option<bool>,
    enabled: Option<bool>,
    redirect: Option<String>,
    #[serde(rename = "static")]
    static_files: Option<RawStatic>,
    proxy: Option<RawProxy>,
    run_command: Option<RawRunCommand>,
}

/// `static: ./dir` or `static: { dir, index, notFound }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStatic {
    Dir(String),
    #[serde(rename_all = "camelCase")]
    Full {
        dir: String,
        index: Option<String>,
        not_found: Option<String>,
    },
}

/// `proxy: http://backend` or `proxy: { url, removePrefix }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawProxy {
    Url(String),
    #[serde(rename_all = "camelCase")]
    Full {
        url: String,
        remove_prefix: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRunCommand {
    #[serde(default)]
    token: String,
    #[serde(default)]
    command: Vec<String>,
}

impl RawEndpoint {
    fn into_endpoint(self, base_dir: &Path) -> Result<Endpoint, ConfigError> {
        let url = EndpointUrl::parse(&self.url)?;
        let https = HttpsMode::parse(&self.https).ok_or_else(|| {
            ConfigError::Validation(format!(
                "endpoint {}: unknown https mode '{}' (expected \"\", acme or self)",
                url, self.https
            ))
        })?;

        let mut actions = Vec::with_capacity(1);
        if let Some(target) = self.redirect.filter(|t| !t.is_empty()) {
            actions.push(Action::Redirect(target));
        }
        if let Some(raw) = self.static_files {
            actions.push(Action::Static(raw.into_action(base_dir)));
        }
        if let Some(raw) = self.proxy {
            actions.push(Action::Proxy(raw.into_action(&url)?));
        }
        if let Some(raw) = self.run_command {
            actions.push(Action::RunCommand(raw.into_action(&url)?));
        }

        let action = match actions.len() {
            0 => {
                return Err(ConfigError::Validation(format!(
                    "endpoint {}: no action configured",
                    url
                )))
            }
            1 => actions.remove(0),
            _ => {
                return Err(ConfigError::Validation(format!(
                    "endpoint {}: too many actions, expected exactly one",
                    url
                )))
            }
        };

        Ok(Endpoint {
            url,
            https,
            redirect_to_https: self.redirect_to_https.unwrap_or(true),
            enabled: self.enabled.unwrap_or(true),
            action,
        })
    }
}

impl RawStatic {
    fn into_action(self, base_dir: &Path) -> StaticAction {
        let (dir, index, not_found) = match self {
            RawStatic::Dir(dir) => (dir, None, None),
            RawStatic::Full {
                dir,
                index,
                not_found,
            } => (dir, index, not_found),
        };
        StaticAction {
            dir: resolve_path(base_dir, &dir),
            index: index
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_INDEX.to_string()),
            not_found: not_found
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_NOT_FOUND.to_string()),
        }
    }
}

impl RawProxy {
    fn into_action(self, endpoint: &EndpointUrl) -> Result<ProxyAction, ConfigError> {
        let (raw_url, remove_prefix) = match self {
            RawProxy::Url(url) => (url, None),
            RawProxy::Full { url, remove_prefix } => (url, remove_prefix),
        };
        let with_scheme = if raw_url.contains("://") {
            raw_url.clone()
        } else {
            format!("http://{}", raw_url)
        };
        let url = Url::parse(&with_scheme).map_err(|e| {
            ConfigError::Validation(format!(
                "endpoint {}: invalid proxy url '{}': {}",
                endpoint, raw_url, e
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::Validation(format!(
                "endpoint {}: proxy url '{}' must be an http(s) url with a host",
                endpoint, raw_url
            )));
        }
        Ok(ProxyAction {
            url,
            remove_prefix: remove_prefix.filter(|p| !p.is_empty()),
        })
    }
}

impl RawRunCommand {
    fn into_action(self, endpoint: &EndpointUrl) -> Result<RunCommandAction, ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::Validation(format!(
                "endpoint {}: token must not be empty in runCommand",
                endpoint
            )));
        }
        if self.command.is_empty() {
            return Err(ConfigError::Validation(format!(
                "endpoint {}: command must not be empty in runCommand",
                endpoint
            )));
        }
        Ok(RunCommandAction {
            token: self.token,
            command: self.command,
        })
    }
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

// =============================================================================
// Loading and derived views
// =============================================================================

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&contents, base_dir)
    }

    /// Parse and validate YAML. Relative paths are resolved against `base_dir`.
    pub fn from_yaml(contents: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(contents)?;

        let log_level = raw.log_level.as_deref().unwrap_or_default();
        let log_level = LogLevel::parse(log_level).ok_or_else(|| {
            ConfigError::Validation(format!("invalid log level '{}'", log_level))
        })?;

        let log_file = match raw.log_file.as_deref() {
            Some(NULL_LOG_FILE) => PathBuf::from(NULL_LOG_FILE),
            Some(file) if !file.is_empty() => resolve_path(base_dir, file),
            _ => resolve_path(base_dir, DEFAULT_LOG_FILE),
        };
        let certs_file = match raw.certs_file.as_deref() {
            Some(file) if !file.is_empty() => resolve_path(base_dir, file),
            _ => resolve_path(base_dir, DEFAULT_CERTS_FILE),
        };

        let endpoints = raw
            .endpoints
            .into_iter()
            .map(|endpoint| endpoint.into_endpoint(base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            ports: raw.ports,
            log_file,
            certs_file,
            log_level,
            endpoints,
        };
        config.check_https_modes()?;
        Ok(config)
    }

    /// A host obtains its certificate one way only.
    fn check_https_modes(&self) -> Result<(), ConfigError> {
        let mut modes: HashMap<&str, HttpsMode> = HashMap::new();
        for endpoint in self.enabled_endpoints() {
            if endpoint.https == HttpsMode::None {
                continue;
            }
            if endpoint.url.host == WILDCARD_HOST {
                return Err(ConfigError::Validation(format!(
                    "endpoint {}: https requires a concrete host",
                    endpoint.url
                )));
            }
            match modes.insert(&endpoint.url.host, endpoint.https) {
                Some(previous) if previous != endpoint.https => {
                    return Err(ConfigError::Validation(format!(
                        "host {} is configured with both acme and self-signed https",
                        endpoint.url.host
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn enabled_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.enabled)
    }

    /// Distinct hosts across all endpoints.
    pub fn hosts(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|e| e.url.host.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn acme_hosts(&self) -> Vec<String> {
        self.hosts_with_mode(HttpsMode::Acme)
    }

    pub fn self_hosts(&self) -> Vec<String> {
        self.hosts_with_mode(HttpsMode::SelfSigned)
    }

    fn hosts_with_mode(&self, mode: HttpsMode) -> Vec<String> {
        self.enabled_endpoints()
            .filter(|e| e.https == mode)
            .map(|e| e.url.host.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// True when at least one enabled endpoint needs the TLS listener.
    pub fn uses_https(&self) -> bool {
        self.enabled_endpoints().any(|e| e.https != HttpsMode::None)
    }

    /// Tracing filter derived from `logLevel`.
    pub fn log_filter(&self) -> String {
        let level = self.log_level.as_str();
        format!("portico={level},tower_http={level}")
    }

    pub fn log_file(&self) -> Option<&Path> {
        if self.log_file == Path::new(NULL_LOG_FILE) {
            None
        } else {
            Some(&self.log_file)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
