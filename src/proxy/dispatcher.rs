//! Single-threaded proxy core.
//!
//! The dispatcher owns the [`ConnectionRegistry`] and [`ChannelDirectory`]
//! and processes one connection event at a time: accepted, bytes received,
//! closed. Nothing else mutates the routing tables, so admission checks and
//! cleanup never race.
//!
//! Per-connection pipeline:
//!
//! ```text
//! Unclassified ──HandshakeBuffer──┬─► ServerMember/ClientMember ──FrameDecoder──► Router
//!                                 └─► RawClient ──────────────── chunk as `data` ─► root server
//! ```

use std::io;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::directory::ChannelDirectory;
use crate::proxy::framing::{Frame, FrameDecoder};
use crate::proxy::handshake::{
    classify_and_authenticate, rejection_response, HandshakeProgress, HandshakeRequest,
};
use crate::proxy::registry::{
    ConnectionId, ConnectionRegistry, Delivery, Inbound, Role, Transport,
};
use crate::proxy::router::{Dispatch, Router};

/// What one inbound chunk turned into, computed before acting on it.
enum Step {
    Handshake(HandshakeProgress),
    Frames {
        frames: Vec<Frame>,
        role: Role,
        error: Option<ProxyError>,
    },
    Raw,
}

/// Owner of all routing state; drives connections through their pipelines.
#[derive(Debug)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    directory: ChannelDirectory,
    max_frame_bytes: u32,
    outbound_high_water: usize,
}

impl Dispatcher {
    /// Build the tables from configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_handshake_bytes),
            directory: ChannelDirectory::new(config.channels.clone()),
            max_frame_bytes: config.max_frame_bytes,
            outbound_high_water: config.outbound_high_water,
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Channel table.
    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    /// Track a freshly accepted connection as `Unclassified`.
    ///
    /// # Errors
    ///
    /// [`ProxyError::DuplicateConnection`]; the transport is closed.
    pub fn accept(&mut self, id: ConnectionId, mut transport: Box<dyn Transport>) -> ProxyResult<()> {
        if self.registry.get(id).is_ok() {
            transport.close();
            return Err(ProxyError::DuplicateConnection(id));
        }
        self.registry.register(id, transport)?;
        debug!("[Conn {id}] Accepted ({} open)", self.registry.len());
        Ok(())
    }

    /// Feed bytes read from connection `id`.
    pub fn receive(&mut self, id: ConnectionId, chunk: Bytes) {
        let step = {
            let Ok(conn) = self.registry.get_mut(id) else {
                debug!("[Conn {id}] Dropping {} bytes for closed connection", chunk.len());
                return;
            };
            let role = conn.role().clone();
            match &mut conn.inbound {
                Inbound::Handshake(buffer) => buffer.push(&chunk).map(Step::Handshake),
                Inbound::Framed(decoder) => {
                    let decoded = decoder.feed_until_error(chunk.clone());
                    Ok(Step::Frames {
                        frames: decoded.frames,
                        role,
                        error: decoded.error,
                    })
                }
                Inbound::Raw => Ok(Step::Raw),
            }
        };

        match step {
            Err(e) => self.reject(id, &e),
            Ok(Step::Handshake(HandshakeProgress::Pending)) => {}
            Ok(Step::Handshake(HandshakeProgress::Raw(bytes))) => self.become_raw(id, bytes),
            Ok(Step::Handshake(HandshakeProgress::Complete { request, bytes })) => {
                self.admit(id, &request, bytes);
            }
            Ok(Step::Frames { frames, role, error }) => {
                for frame in frames {
                    self.route_frame(id, &role, frame);
                }
                if let Some(e) = error {
                    self.reject(id, &e);
                }
            }
            Ok(Step::Raw) => {
                let dispatch = Router::new(&self.registry, &self.directory).raw_data(id, chunk);
                self.apply_or_drop(id, dispatch);
            }
        }
    }

    /// Close connection `id` and purge it from every table.
    ///
    /// A raw client's root server is told about the close first. A
    /// connection still unclassified with bytes buffered is treated as raw,
    /// so those bytes reach the root server before the close; one that sent
    /// nothing is announced to nobody. Safe to call any number of times.
    pub fn close(&mut self, id: ConnectionId) {
        let Ok(conn) = self.registry.get_mut(id) else {
            return;
        };
        let pending = match &mut conn.inbound {
            Inbound::Handshake(buffer) if !buffer.is_empty() => Some(buffer.take()),
            _ => None,
        };
        if let Some(bytes) = pending {
            debug!("[Handshake] Conn {id} closed mid-handshake, tunnelling {} bytes", bytes.len());
            self.become_raw(id, bytes);
        }

        if self.registry.get(id).is_ok_and(|conn| *conn.role() == Role::RawClient) {
            let dispatch = Router::new(&self.registry, &self.directory).raw_close(id);
            self.apply_or_drop(id, dispatch);
        }

        if let Some(conn) = self.registry.remove(id, &mut self.directory) {
            match conn.role() {
                Role::ServerMember(channel) => {
                    info!("[Conn {id}] Server of {channel} disconnected, channel released");
                }
                role => info!("[Conn {id}] Disconnected ({role:?})"),
            }
        }
    }

    /// Record an I/O failure on one connection and close it.
    pub fn transport_failed(&mut self, id: ConnectionId, error: io::Error) {
        warn!("[Conn {id}] {}", ProxyError::Transport(error));
        self.close(id);
    }

    /// Destroy every tracked connection.
    pub fn shutdown(&mut self) {
        let ids = self.registry.ids();
        info!("[Proxy] Closing {} connection(s)", ids.len());
        for id in ids {
            self.close(id);
        }
    }

    fn reject(&mut self, id: ConnectionId, error: &ProxyError) {
        if let Some(status) = error.rejection_status() {
            info!("[Handshake] Refusing conn {id} with {status}: {error}");
            // Best effort; the connection is closing either way.
            if let Err(e) = self.registry.send(id, rejection_response(status)) {
                debug!("[Conn {id}] Rejection not sent: {e}");
            }
        } else {
            info!("[Conn {id}] Closing: {error}");
        }
        self.close(id);
    }

    fn become_raw(&mut self, id: ConnectionId, buffered: Bytes) {
        if let Err(e) = self.promote(id, Role::RawClient) {
            self.reject(id, &e);
            return;
        }
        info!("[Handshake] Conn {id} is a raw client");

        let router = Router::new(&self.registry, &self.directory);
        let announce = router.raw_connection(id);
        let data = (!buffered.is_empty()).then(|| router.raw_data(id, buffered));
        self.apply_or_drop(id, announce);
        if let Some(data) = data {
            self.apply_or_drop(id, data);
        }
    }

    fn admit(&mut self, id: ConnectionId, request: &HandshakeRequest, bytes: Bytes) {
        let admission = match classify_and_authenticate(id, request, &mut self.directory) {
            Ok(admission) => admission,
            Err(e) => {
                self.reject(id, &e);
                return;
            }
        };
        if admission.role == Role::RawClient {
            self.become_raw(id, bytes);
            return;
        }

        if let Some(response) = admission.response {
            if let Err(e) = self.registry.send(id, Bytes::from_static(response)) {
                self.reject(id, &e);
                return;
            }
        }
        info!("[Handshake] Conn {id} admitted as {:?}", admission.role);
        if let Err(e) = self.promote(id, admission.role) {
            self.reject(id, &e);
            return;
        }

        let leftover = bytes.slice(request.handshake_len..);
        if !leftover.is_empty() {
            self.receive(id, leftover);
        }
    }

    fn promote(&mut self, id: ConnectionId, role: Role) -> ProxyResult<()> {
        let inbound = match role {
            Role::RawClient | Role::Unclassified => Inbound::Raw,
            Role::ServerMember(_) | Role::ClientMember(_) => {
                Inbound::Framed(FrameDecoder::new(self.max_frame_bytes))
            }
        };
        self.registry.get_mut(id)?.promote(role, inbound)
    }

    fn route_frame(&mut self, sender: ConnectionId, role: &Role, frame: Frame) {
        let dispatch = Router::new(&self.registry, &self.directory).route(sender, role, frame);
        self.apply_or_drop(sender, dispatch);
    }

    fn apply_or_drop(&mut self, sender: ConnectionId, dispatch: ProxyResult<Dispatch>) {
        let result = dispatch.and_then(|dispatch| self.apply(dispatch));
        if let Err(e) = result {
            debug!("[Router] Dropped frame from {sender}: {e}");
        }
    }

    /// Carry out a routing decision. A failed write closes the destination.
    fn apply(&mut self, dispatch: Dispatch) -> ProxyResult<()> {
        match dispatch {
            Dispatch::Frame { to, frame } => {
                let bytes = frame.encode()?;
                self.deliver(to, bytes).map(drop)
            }
            Dispatch::Raw { to, bytes } => self.deliver(to, bytes).map(drop),
            Dispatch::Close(id) => {
                info!("[Router] Root server closed raw client {id}");
                self.close(id);
                Ok(())
            }
        }
    }

    fn deliver(&mut self, to: ConnectionId, bytes: Bytes) -> ProxyResult<Delivery> {
        match self.registry.send(to, bytes) {
            Ok(delivery) => {
                if delivery.queued_bytes > self.outbound_high_water {
                    warn!(
                        "[Conn {to}] {} bytes queued (high water {})",
                        delivery.queued_bytes, self.outbound_high_water
                    );
                }
                Ok(delivery)
            }
            Err(e) => {
                warn!("[Conn {to}] Delivery failed: {e}");
                self.close(to);
                Err(e)
            }
        }
    }
}
