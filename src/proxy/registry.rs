//! Connection registry: live connections by id.
//!
//! The registry exclusively owns every [`Connection`] (transport, role and
//! inbound pipeline state). The directory and router refer to connections by
//! [`ConnectionId`] only. Removing a connection closes its transport and
//! purges the directory entries for its id in the same step, so a closed id
//! is never routable.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::constants::DEFAULT_MAX_HANDSHAKE_BYTES;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::directory::ChannelDirectory;
use crate::proxy::framing::FrameDecoder;
use crate::proxy::handshake::HandshakeBuffer;

/// Identity of an open connection, unique among currently open connections.
///
/// Id `0` is reserved: it addresses the root channel's raw clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw numeric id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error parsing a [`ConnectionId`] from an address segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseConnectionIdError(String);

impl fmt::Display for ParseConnectionIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not a connection id", self.0)
    }
}

impl std::error::Error for ParseConnectionIdError {}

impl FromStr for ConnectionId {
    type Err = ParseConnectionIdError;

    /// Accepts only the form [`ConnectionId`] displays as: ASCII digits with
    /// no sign and no leading zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let canonical = !s.is_empty()
            && s.bytes().all(|b| b.is_ascii_digit())
            && (s == "0" || !s.starts_with('0'));
        if !canonical {
            return Err(ParseConnectionIdError(s.to_string()));
        }
        s.parse()
            .map(Self)
            .map_err(|_| ParseConnectionIdError(s.to_string()))
    }
}

/// What a connection is, as decided by the handshake negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepted, handshake not yet decided.
    Unclassified,
    /// Registered server of the named channel.
    ServerMember(String),
    /// Admitted client of the named channel.
    ClientMember(String),
    /// Unauthenticated connection tunnelled through the root channel.
    RawClient,
}

impl Role {
    /// Channel this role belongs to, if it is a member role.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::ServerMember(c) | Self::ClientMember(c) => Some(c),
            Self::Unclassified | Self::RawClient => None,
        }
    }
}

/// Receipt for a queued outbound write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Bytes queued towards the peer but not yet written, including this write.
    pub queued_bytes: usize,
}

/// Outbound half of a connection.
///
/// Writes are queued, never awaited; the returned [`Delivery`] exposes how
/// far the peer is falling behind.
pub trait Transport: Send + fmt::Debug {
    /// Queue bytes for the peer.
    ///
    /// # Errors
    ///
    /// [`ProxyError::ConnectionClosed`] once the transport has been closed or
    /// its writer has failed.
    fn send(&self, bytes: Bytes) -> ProxyResult<Delivery>;

    /// Close the transport after already queued bytes are flushed.
    ///
    /// Calling this more than once is a no-op.
    fn close(&mut self);

    /// Whether [`Transport::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// Inbound pipeline stage of a connection.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Buffering the handshake.
    Handshake(HandshakeBuffer),
    /// Member connection speaking frames.
    Framed(FrameDecoder),
    /// Raw client; every chunk is passed through.
    Raw,
}

/// A live connection owned by the registry.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    role: Role,
    pub(crate) inbound: Inbound,
}

impl Connection {
    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Outbound transport.
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Leave `Unclassified` for a decided role. Roles never change afterwards.
    pub(crate) fn promote(&mut self, role: Role, inbound: Inbound) -> ProxyResult<()> {
        if self.role != Role::Unclassified || role == Role::Unclassified {
            return Err(ProxyError::MalformedHandshake(format!(
                "connection {} cannot move from {:?} to {:?}",
                self.id, self.role, role
            )));
        }
        self.role = role;
        self.inbound = inbound;
        Ok(())
    }
}

/// Live connections keyed by id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    max_handshake_bytes: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry; new connections buffer at most
    /// `max_handshake_bytes` of handshake.
    pub fn new(max_handshake_bytes: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_handshake_bytes,
        }
    }

    /// Add a new `Unclassified` connection.
    ///
    /// # Errors
    ///
    /// [`ProxyError::DuplicateConnection`] if `id` is already open.
    pub fn register(&mut self, id: ConnectionId, transport: Box<dyn Transport>) -> ProxyResult<()> {
        if self.connections.contains_key(&id) {
            return Err(ProxyError::DuplicateConnection(id));
        }
        self.connections.insert(
            id,
            Connection {
                id,
                transport,
                role: Role::Unclassified,
                inbound: Inbound::Handshake(HandshakeBuffer::new(self.max_handshake_bytes)),
            },
        );
        Ok(())
    }

    /// Look up a connection.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnknownConnection`] if `id` is not open.
    pub fn get(&self, id: ConnectionId) -> ProxyResult<&Connection> {
        self.connections
            .get(&id)
            .ok_or(ProxyError::UnknownConnection(id))
    }

    /// Look up a connection mutably.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnknownConnection`] if `id` is not open.
    pub fn get_mut(&mut self, id: ConnectionId) -> ProxyResult<&mut Connection> {
        self.connections
            .get_mut(&id)
            .ok_or(ProxyError::UnknownConnection(id))
    }

    /// Queue bytes on a connection's transport.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnknownConnection`] or the transport's send error.
    pub fn send(&self, id: ConnectionId, bytes: Bytes) -> ProxyResult<Delivery> {
        self.get(id)?.transport.send(bytes)
    }

    /// Remove a connection, close its transport and purge its directory entries.
    ///
    /// Returns `None` if the connection was already removed.
    pub fn remove(
        &mut self,
        id: ConnectionId,
        directory: &mut ChannelDirectory,
    ) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;
        conn.transport.close();
        directory.release_connection(id);
        Some(conn)
    }

    /// Ids of all open connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDSHAKE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::test_support::RecordingTransport;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(1024)
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = registry();
        let (transport, _tap) = RecordingTransport::new();
        registry.register(ConnectionId::new(1), Box::new(transport)).unwrap();

        let conn = registry.get(ConnectionId::new(1)).unwrap();
        assert_eq!(conn.role(), &Role::Unclassified);
        assert!(matches!(conn.inbound, Inbound::Handshake(_)));
        assert!(matches!(
            registry.get(ConnectionId::new(2)),
            Err(ProxyError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let mut registry = registry();
        let (a, _pa) = RecordingTransport::new();
        let (b, _pb) = RecordingTransport::new();
        registry.register(ConnectionId::new(1), Box::new(a)).unwrap();
        assert!(matches!(
            registry.register(ConnectionId::new(1), Box::new(b)),
            Err(ProxyError::DuplicateConnection(_))
        ));
    }

    #[test]
    fn test_remove_closes_transport_and_releases_directory() {
        let mut registry = registry();
        let mut directory = ChannelDirectory::new(std::iter::empty());
        let (transport, tap) = RecordingTransport::new();
        let id = ConnectionId::new(3);
        registry.register(id, Box::new(transport)).unwrap();
        directory.register_server(id, "/room", "", Some("tok")).unwrap();

        assert!(registry.remove(id, &mut directory).is_some());
        assert!(tap.is_closed());
        assert_eq!(directory.server_of("/room"), None);

        // Redundant removal is a no-op.
        assert!(registry.remove(id, &mut directory).is_none());
        assert_eq!(tap.close_calls(), 1);
    }

    #[test]
    fn test_id_can_be_reused_after_removal() {
        let mut registry = registry();
        let mut directory = ChannelDirectory::new(std::iter::empty());
        let (a, _pa) = RecordingTransport::new();
        let (b, _pb) = RecordingTransport::new();
        let id = ConnectionId::new(9);
        registry.register(id, Box::new(a)).unwrap();
        registry.remove(id, &mut directory);
        registry.register(id, Box::new(b)).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_promote_only_from_unclassified() {
        let mut registry = registry();
        let (transport, _tap) = RecordingTransport::new();
        let id = ConnectionId::new(1);
        registry.register(id, Box::new(transport)).unwrap();

        let conn = registry.get_mut(id).unwrap();
        conn.promote(Role::RawClient, Inbound::Raw).unwrap();
        assert!(conn
            .promote(Role::ClientMember("/".into()), Inbound::Raw)
            .is_err());
        assert_eq!(conn.role(), &Role::RawClient);
    }

    #[test]
    fn test_connection_id_parse() {
        assert_eq!("42".parse::<ConnectionId>().unwrap(), ConnectionId::new(42));
        assert_eq!("0".parse::<ConnectionId>().unwrap(), ConnectionId::new(0));
        assert!("x".parse::<ConnectionId>().is_err());
        assert_eq!(ConnectionId::new(7).to_string(), "7");
    }

    #[test]
    fn test_connection_id_parse_rejects_non_canonical_forms() {
        for text in ["", "+2", "02", "00", "-1", " 2", "2 ", "18446744073709551616"] {
            assert!(text.parse::<ConnectionId>().is_err(), "{text:?} parsed");
        }
        for n in [1_u64, 10, 2_000, u64::MAX] {
            assert_eq!(n.to_string().parse::<ConnectionId>().unwrap().get(), n);
        }
    }
}
