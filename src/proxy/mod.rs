//! Channel-multiplexing TCP proxy.
//!
//! Servers register a named channel, clients join it with the channel's
//! token, and every byte between them flows through the proxy as framed
//! messages. Connections that never declare a role are tunnelled raw to the
//! root channel's server.
//!
//! # Architecture
//!
//! ```text
//!  accept loop ──┐
//!  read task 1 ──┤ ProxyEvent   ┌──────────────────────────────┐
//!  read task 2 ──┼─────────────►│ Dispatcher                   │
//!  read task n ──┘   (mpsc)     │  ConnectionRegistry          │
//!                               │  ChannelDirectory            │
//!                               │  Router                      │
//!                               └──────────────┬───────────────┘
//!                                              │ Transport::send
//!                                              ▼
//!                                   write task per connection
//! ```
//!
//! # Wire Protocol
//!
//! Members open with an HTTP-style upgrade (see [`handshake`]) and then
//! exchange frames: `[u32 BE totalLength][u32 BE headerLength][JSON header][body]`
//! (see [`framing`]).

pub mod connection;
pub mod directory;
pub mod dispatcher;
pub(crate) mod events;
pub mod framing;
pub mod handshake;
pub mod registry;
pub mod router;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::Dispatcher;
pub use server::{ProxyHandle, ProxyServer};
