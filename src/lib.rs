//! Portico: a configuration-driven multi-host HTTP/HTTPS server.
//!
//! Endpoints are declared in YAML and served by host and path prefix. Hosts
//! can get certificates from Let's Encrypt or fall back to self-signed ones,
//! and the whole server set restarts when the configuration file changes.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod reload;
pub mod routes;
pub mod tls;

pub use error::AppError;
