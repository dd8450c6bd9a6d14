//! chanproxy - single-port TCP channel multiplexing proxy.
//!
//! One listening port carries many independent channels. A channel server
//! registers a channel name with an HTTP-style upgrade, clients join it by
//! presenting the channel's token, and the proxy relays length-prefixed
//! frames between them, rewriting addresses so each side can tell who is
//! talking. Connections that never declare a role are tunnelled raw to the
//! server of the root channel `/`.
//!
//! # Modules
//!
//! - [`proxy`] - listener, dispatcher, handshake, codec, directory and router
//! - [`config`] - configuration loading
//! - [`error`] - proxy error taxonomy
//! - [`constants`] - protocol constants and defaults

pub mod config;
pub mod constants;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{ProxyError, ProxyResult};
pub use proxy::{ProxyHandle, ProxyServer};
