//! tor2web-gateway - an HTTPS gateway to Tor hidden services
//!
//! This library provides a Tor2web gateway engine that:
//! - Terminates TLS for a public hostname and serves HTTP/1.1 and HTTP/2
//! - Relays requests to a hidden service through the Tor SOCKS5 port
//!   (TRANSLATION mode) or to a local backend (PROXY mode)
//! - Strips client-identifying headers from every upstream request
//! - Rewrites links to the origin and injects a banner and disclaimer
//! - Serves Tor Browser downloads (GetTor) and redirects Tor users to the
//!   hidden service itself

pub mod body;
pub mod config;
pub mod error;
pub mod gateway;
pub mod gettor;
pub mod headers;
pub mod rewrite;
pub mod router;
pub mod server;
pub mod tls;
pub mod transport;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
