//! Protocol and runtime constants for chanproxy.
//!
//! Wire-level constants live here so the codec, the handshake negotiator and
//! the router agree on them. Limits that operators may tune have a default
//! here and an override in [`crate::config::Config`].

use std::time::Duration;

// ============================================================================
// Channels & addressing
// ============================================================================

/// Name of the preconfigured root channel that carries raw-client traffic.
pub const ROOT_CHANNEL: &str = "/";

/// Address segment that stands for "a raw client of the root channel".
///
/// Raw clients appear to the root server as `0/<connection id>`.
pub const RAW_ORIGIN: &str = "0";

/// Separator between connection ids in a `to`/`from` address.
pub const ADDRESS_SEPARATOR: char = '/';

// ============================================================================
// Framing
// ============================================================================

/// Bytes taken by the two `u32` length fields at the head of every frame.
pub const FRAME_PREFIX_LEN: usize = 8;

/// Default cap on a frame's declared `totalLength` (16 MB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

// ============================================================================
// Handshake
// ============================================================================

/// Default cap on buffered handshake bytes before the terminating blank line.
pub const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// Blank line that terminates the handshake request head.
pub const HANDSHAKE_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Only request method a member handshake may use.
pub const HANDSHAKE_METHOD_PREFIX: &[u8] = b"GET ";

/// Role tag a channel server puts first in `Proxy-Authorization`.
pub const ROLE_TAG_SERVER: &str = "Server";

/// Role tag a channel client puts first in `Proxy-Authorization`.
pub const ROLE_TAG_CLIENT: &str = "Client";

/// Response written to an admitted member before switching to frames.
pub const UPGRADE_RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: tcp\r\n\
Connection: Upgrade\r\n\
\r\n";

// ============================================================================
// Sockets
// ============================================================================

/// Size of the per-connection socket read buffer.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 80;

/// Default bind address.
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Default queued-outbound-bytes mark above which deliveries are reported.
pub const DEFAULT_OUTBOUND_HIGH_WATER: usize = 8 * 1024 * 1024;

/// How long a closing connection may keep flushing queued bytes to a peer
/// that is not reading before they are discarded.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
