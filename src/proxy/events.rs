//! Unified event channel for the dispatcher loop.
//!
//! The accept loop and every connection's read task send events through a
//! single `mpsc::UnboundedSender<ProxyEvent>`. The dispatcher loop receives
//! them in order and is the only place routing tables change.

// Rust guideline compliant 2026-02

use std::io;

use bytes::Bytes;

use super::connection::TcpConnection;
use super::registry::ConnectionId;

/// Event from a background task delivered to the dispatcher loop.
#[derive(Debug)]
pub(crate) enum ProxyEvent {
    /// Listener accepted a socket; its read and write tasks are running.
    Accepted {
        /// Id assigned by the accept loop.
        id: ConnectionId,
        /// Outbound half, handed to the registry.
        conn: TcpConnection,
    },

    /// Bytes read from a connection.
    Data {
        /// Connection the bytes came from.
        id: ConnectionId,
        /// The chunk as read.
        bytes: Bytes,
    },

    /// Peer closed its end (EOF).
    Closed {
        /// Connection that reached EOF.
        id: ConnectionId,
    },

    /// Read failed on one connection.
    Failed {
        /// Connection whose read failed.
        id: ConnectionId,
        /// Underlying error.
        error: io::Error,
    },

    /// The listener can no longer accept; the proxy must stop.
    ListenerFailed(io::Error),
}
