//! Gateward - a supervising gate in front of a loopback AI gateway
//!
//! This library provides a single-port sidecar that:
//! - Spawns and supervises the gateway child process, starting it on the
//!   first proxied request and probing until it answers
//! - Forwards all non-admin traffic verbatim, WebSocket upgrades included
//! - Serves an operator admin surface behind Basic auth with per-client
//!   rate limiting and lockout
//! - Redacts secrets from every piece of subprocess output that could
//!   reach an HTTP response
//! - Exports and imports the gateway's state as a streamed tar.gz with
//!   path-safe extraction

pub mod admin;
pub mod backup;
pub mod config;
pub mod console;
pub mod dirs;
pub mod error;
pub mod proxy;
pub mod ratelimit;
pub mod redact;
pub mod server;
pub mod supervisor;
