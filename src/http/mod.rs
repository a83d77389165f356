//! HTTP server module with TLS support.
//!
//! The server set owns:
//! - A plaintext HTTP listener (always)
//! - An HTTPS listener when an endpoint uses ACME or self-signed certificates
//! - The ACME renewal task when ACME hosts are configured
//!
//! Listeners are shut down gracefully on reload and on SIGTERM/SIGINT.

mod server;
mod shutdown;

pub use server::{ListenerExit, ServerError, ServerSet, ServerState};
pub use shutdown::interrupt;
