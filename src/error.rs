//! Error taxonomy for the proxy core.
//!
//! Handshake and routing failures are per-connection: they close (or, for
//! [`ProxyError::UnroutableFrame`], merely drop a frame from) the offending
//! connection and never reach sibling connections. Only
//! [`ProxyError::Listener`] is fatal for the whole proxy.

use std::io;

use crate::proxy::registry::ConnectionId;

/// Errors raised by the negotiator, codec, directory, registry and router.
#[derive(Debug)]
pub enum ProxyError {
    /// Handshake request could not be parsed.
    MalformedHandshake(String),
    /// Presented admission token does not match the channel's token.
    BadToken {
        /// Channel the connection tried to join.
        channel: String,
    },
    /// A server is already registered for the channel.
    ChannelBusy {
        /// Channel that already has a server.
        channel: String,
    },
    /// A client tried to join a channel the directory does not know.
    NoSuchChannel {
        /// Requested channel name.
        channel: String,
    },
    /// Declared frame length exceeds the configured cap.
    FrameTooLarge {
        /// Declared `totalLength`.
        length: u64,
        /// Configured maximum.
        max: u32,
    },
    /// Frame bytes are structurally invalid.
    MalformedFrame(String),
    /// Frame has no valid destination; it is dropped, never fatal.
    UnroutableFrame(String),
    /// Connection id is already registered.
    DuplicateConnection(ConnectionId),
    /// Connection id is not registered.
    UnknownConnection(ConnectionId),
    /// Write attempted on a transport that has been closed.
    ConnectionClosed(ConnectionId),
    /// I/O failure on a single connection.
    Transport(io::Error),
    /// Listener failure; routing tables can no longer be trusted.
    Listener(io::Error),
}

impl ProxyError {
    /// Whether this error must tear down the whole proxy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Listener(_))
    }

    /// Status line sent to a rejected handshake, if the error is a rejection.
    pub fn rejection_status(&self) -> Option<&'static str> {
        match self {
            Self::MalformedHandshake(_) => Some("400 Bad Request"),
            Self::BadToken { .. } => Some("403 Forbidden"),
            Self::NoSuchChannel { .. } => Some("404 Not Found"),
            Self::ChannelBusy { .. } => Some("409 Conflict"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedHandshake(msg) => write!(f, "Malformed handshake: {msg}"),
            Self::BadToken { channel } => write!(f, "Bad token for {channel}"),
            Self::ChannelBusy { channel } => write!(f, "{channel} not available"),
            Self::NoSuchChannel { channel } => write!(f, "No such channel: {channel}"),
            Self::FrameTooLarge { length, max } => {
                write!(f, "Frame too large: {length} bytes (max {max})")
            }
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {msg}"),
            Self::UnroutableFrame(msg) => write!(f, "Unroutable frame: {msg}"),
            Self::DuplicateConnection(id) => write!(f, "Connection {id} already registered"),
            Self::UnknownConnection(id) => write!(f, "Connection {id} not found"),
            Self::ConnectionClosed(id) => write!(f, "Connection {id} is closed"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Listener(e) => write!(f, "Listener error: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) | Self::Listener(e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias for proxy-core operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
