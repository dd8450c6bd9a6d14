//! Frame routing between a channel's server and its clients.
//!
//! Addresses are `/`-joined connection-id paths. Heading to a server, the
//! router prefixes the sender's id onto `from`; heading to a client, it pops
//! the first segment off `to`. A server can therefore address nested
//! sub-identities behind a client without the router knowing about them.
//!
//! ```text
//! client 2 ── {event, from: "x"}     ──► server   {event, from: "2/x"}
//! server   ── {event, to: "2/hello"} ──► client 2 {event, to: "hello"}
//! server / ── {event, to: "0/7"}     ──► raw client 7 (body bytes only)
//! ```
//!
//! The router only decides; it never writes. The dispatcher applies each
//! [`Dispatch`] and gets back a delivery receipt.

use bytes::Bytes;

use crate::constants::{ADDRESS_SEPARATOR, RAW_ORIGIN, ROOT_CHANNEL};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::directory::ChannelDirectory;
use crate::proxy::framing::{Frame, FrameHeader};
use crate::proxy::registry::{ConnectionId, ConnectionRegistry, Role};

/// Event name for raw-client lifecycle and data frames.
pub mod raw_event {
    /// A raw client connected.
    pub const CONNECTION: &str = "connection";
    /// A chunk of raw bytes.
    pub const DATA: &str = "data";
    /// A raw client closed; from the root server, a request to close one.
    pub const CLOSE: &str = "close";
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Send a frame to a member connection.
    Frame {
        /// Destination connection.
        to: ConnectionId,
        /// Rewritten frame.
        frame: Frame,
    },
    /// Write bytes verbatim to a raw client.
    Raw {
        /// Destination raw client.
        to: ConnectionId,
        /// Payload bytes.
        bytes: Bytes,
    },
    /// Close a raw client.
    Close(ConnectionId),
}

/// Split an address into its first segment and the remainder.
fn split_address(address: &str) -> (&str, &str) {
    address
        .split_once(ADDRESS_SEPARATOR)
        .unwrap_or((address, ""))
}

fn unroutable(reason: impl Into<String>) -> ProxyError {
    ProxyError::UnroutableFrame(reason.into())
}

/// Routes frames using read-only views of the registry and directory.
#[derive(Debug, Clone, Copy)]
pub struct Router<'a> {
    registry: &'a ConnectionRegistry,
    directory: &'a ChannelDirectory,
}

impl<'a> Router<'a> {
    /// Create a router over the current tables.
    pub fn new(registry: &'a ConnectionRegistry, directory: &'a ChannelDirectory) -> Self {
        Self {
            registry,
            directory,
        }
    }

    /// Route a frame decoded from `sender`, whose role is `role`.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnroutableFrame`] when the frame must be dropped.
    pub fn route(&self, sender: ConnectionId, role: &Role, frame: Frame) -> ProxyResult<Dispatch> {
        match role {
            Role::ServerMember(channel) => self.route_from_server(channel, frame),
            Role::ClientMember(channel) => self.route_from_client(sender, channel, frame),
            Role::Unclassified | Role::RawClient => Err(unroutable(format!(
                "connection {sender} does not speak frames"
            ))),
        }
    }

    fn route_from_server(&self, channel: &str, frame: Frame) -> ProxyResult<Dispatch> {
        let to = frame
            .header
            .to_address()
            .ok_or_else(|| unroutable("server frame has no `to` address"))?;
        let (head, rest) = split_address(to);
        let (head, rest) = (head.to_string(), rest.to_string());

        if head == RAW_ORIGIN {
            return self.route_to_raw_client(channel, &rest, frame);
        }

        let client: ConnectionId = head
            .parse()
            .map_err(|e| unroutable(format!("bad client id {head:?}: {e}")))?;
        // A server may only address its own current members.
        if self.directory.channel_of(client) != Some(channel) {
            return Err(unroutable(format!(
                "connection {client} is not a member of {channel}"
            )));
        }

        Ok(Dispatch::Frame {
            to: client,
            frame: Frame {
                header: frame.header.with_to(rest),
                body: frame.body,
            },
        })
    }

    fn route_to_raw_client(&self, channel: &str, rest: &str, frame: Frame) -> ProxyResult<Dispatch> {
        if channel != ROOT_CHANNEL {
            return Err(unroutable(format!(
                "server of {channel} cannot address raw clients"
            )));
        }
        let (head, _) = split_address(rest);
        let raw: ConnectionId = head
            .parse()
            .map_err(|e| unroutable(format!("bad raw client id {head:?}: {e}")))?;
        match self.registry.get(raw).map(|conn| conn.role()) {
            Ok(Role::RawClient) => {}
            _ => return Err(unroutable(format!("connection {raw} is not a raw client"))),
        }

        if frame.header.event() == Some(raw_event::CLOSE) {
            Ok(Dispatch::Close(raw))
        } else {
            Ok(Dispatch::Raw {
                to: raw,
                bytes: frame.body,
            })
        }
    }

    fn route_from_client(&self, sender: ConnectionId, channel: &str, frame: Frame) -> ProxyResult<Dispatch> {
        let server = self
            .directory
            .server_of(channel)
            .ok_or_else(|| unroutable(format!("no server registered for {channel}")))?;
        let from = match frame.header.from_address() {
            Some(from) => format!("{sender}{ADDRESS_SEPARATOR}{from}"),
            None => sender.to_string(),
        };
        Ok(Dispatch::Frame {
            to: server,
            frame: Frame {
                header: frame.header.with_from(from),
                body: frame.body,
            },
        })
    }

    /// Announce a new raw client to the root server.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnroutableFrame`] if the root channel has no server.
    pub fn raw_connection(&self, raw: ConnectionId) -> ProxyResult<Dispatch> {
        self.route_to_root_server(raw, raw_event::CONNECTION, Bytes::new())
    }

    /// Wrap a raw client's chunk for the root server.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnroutableFrame`] if the root channel has no server.
    pub fn raw_data(&self, raw: ConnectionId, chunk: Bytes) -> ProxyResult<Dispatch> {
        self.route_to_root_server(raw, raw_event::DATA, chunk)
    }

    /// Tell the root server a raw client closed.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnroutableFrame`] if the root channel has no server.
    pub fn raw_close(&self, raw: ConnectionId) -> ProxyResult<Dispatch> {
        self.route_to_root_server(raw, raw_event::CLOSE, Bytes::new())
    }

    fn route_to_root_server(&self, raw: ConnectionId, event: &str, body: Bytes) -> ProxyResult<Dispatch> {
        let server = self
            .directory
            .server_of(ROOT_CHANNEL)
            .ok_or_else(|| unroutable("no server registered for the root channel"))?;
        Ok(Dispatch::Frame {
            to: server,
            frame: Frame {
                header: FrameHeader::new(event)
                    .with_from(format!("{RAW_ORIGIN}{ADDRESS_SEPARATOR}{raw}")),
                body,
            },
        })
    }
}
