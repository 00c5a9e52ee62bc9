//! Hostproxy - A reverse proxy that routes by Host header
//!
//! This library provides a hostname-based reverse proxy that:
//! - Maps each `Host` to exactly one HTTP or HTTPS backend
//! - Builds one pooled forwarding pipeline per mapped host and reuses it
//! - Reloads its JSON configuration atomically when the file changes
//! - Rate limits clients per IP with a fixed window
//! - Serves plain HTTP and TLS listeners (HTTP/1.1 and HTTP/2)

pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;
pub mod routes;
pub mod tls;
pub mod watcher;

/// Package name for logging and the TLS server name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
