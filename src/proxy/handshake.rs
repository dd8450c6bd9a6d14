//! HTTP-upgrade-style handshake negotiation.
//!
//! A freshly accepted connection is classified from its first bytes:
//!
//! - Bytes that cannot start `GET ` mark a raw client immediately.
//! - A `GET` request is buffered until its blank line (it may arrive split
//!   over many reads). Its `Proxy-Authorization` role tag declares the
//!   identity: `Server <token> [<newToken>]`, `Client <token>`, or anything
//!   else (including no header at all), which makes it a raw client whose
//!   buffered request is tunnelled verbatim.
//!
//! ```text
//! GET <channelPath> HTTP/1.1
//! Upgrade: tcp
//! Connection: Upgrade
//! Proxy-Authorization: Server <admissionToken> <newClientToken>
//! ```

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::constants::{
    HANDSHAKE_METHOD_PREFIX, HANDSHAKE_TERMINATOR, ROLE_TAG_CLIENT, ROLE_TAG_SERVER,
    UPGRADE_RESPONSE,
};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::directory::ChannelDirectory;
use crate::proxy::registry::{ConnectionId, Role};

/// A parsed handshake request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request method (always `GET` for members).
    pub method: String,
    /// Request path; the channel name.
    pub path: String,
    /// Version from the request line, without the `HTTP/` prefix.
    pub http_version: String,
    /// Header fields keyed by lower-cased name.
    pub headers: HashMap<String, String>,
    /// Byte length of the head including the terminating blank line.
    pub handshake_len: usize,
}

/// Identity a request declares through its `Proxy-Authorization` role tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    /// Wants to serve the channel.
    Server {
        /// Token the server must present to be admitted.
        token: String,
        /// Token future clients must present; `None` keeps the current one.
        new_token: Option<String>,
    },
    /// Wants to join the channel as a client.
    Client {
        /// Token the client presents.
        token: String,
    },
}

impl HandshakeRequest {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse the declared identity, or `None` for a plain request.
    pub fn declaration(&self) -> Option<Declaration> {
        let auth = self.header("proxy-authorization")?;
        // Positional: "Server  tok" carries an empty admission token.
        let mut parts = auth.split(' ');
        let tag = parts.next()?;
        let token = parts.next().unwrap_or_default().to_string();
        match tag {
            ROLE_TAG_SERVER => Some(Declaration::Server {
                token,
                new_token: parts.next().map(str::to_string),
            }),
            ROLE_TAG_CLIENT => Some(Declaration::Client { token }),
            _ => None,
        }
    }
}

/// Result of attempting to parse buffered handshake bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The head is complete and well-formed.
    Complete(HandshakeRequest),
    /// The terminating blank line has not arrived yet.
    Incomplete,
    /// The head is complete but cannot be parsed.
    Malformed(String),
}

/// Parse a request head from the start of `buf`.
pub fn try_parse(buf: &[u8]) -> ParseOutcome {
    match find_terminator(buf, 0) {
        Some(end) => parse_head(&buf[..end], end + HANDSHAKE_TERMINATOR.len()),
        None => ParseOutcome::Incomplete,
    }
}

fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(HANDSHAKE_TERMINATOR.len())
        .position(|w| w == HANDSHAKE_TERMINATOR)
        .map(|pos| from + pos)
}

fn parse_head(head: &[u8], handshake_len: usize) -> ParseOutcome {
    let Ok(text) = std::str::from_utf8(head) else {
        return ParseOutcome::Malformed("request head is not UTF-8".to_string());
    };
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split(' ').collect();
    let [method, path, version] = parts.as_slice() else {
        return ParseOutcome::Malformed(format!("bad request line: {request_line:?}"));
    };
    let Some(http_version) = version.strip_prefix("HTTP/") else {
        return ParseOutcome::Malformed(format!("bad protocol version: {version:?}"));
    };
    if path.is_empty() {
        return ParseOutcome::Malformed("empty request path".to_string());
    }

    let mut headers = HashMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return ParseOutcome::Malformed(format!("bad header line: {line:?}"));
        };
        // Trailing spaces are positional in Proxy-Authorization.
        headers.insert(name.trim().to_ascii_lowercase(), value.trim_start().to_string());
    }

    ParseOutcome::Complete(HandshakeRequest {
        method: (*method).to_string(),
        path: (*path).to_string(),
        http_version: http_version.to_string(),
        headers,
        handshake_len,
    })
}

/// What the buffered bytes of an unclassified connection amount to so far.
#[derive(Debug)]
pub enum HandshakeProgress {
    /// Not enough bytes to decide; keep buffering.
    Pending,
    /// Not a member handshake; every buffered byte belongs to the raw stream.
    Raw(Bytes),
    /// A complete request head declaring a member identity.
    Complete {
        /// The parsed request.
        request: HandshakeRequest,
        /// Every buffered byte; those past `request.handshake_len` followed
        /// the blank line.
        bytes: Bytes,
    },
}

/// Accumulates handshake bytes across reads until the connection is classified.
#[derive(Debug)]
pub struct HandshakeBuffer {
    buf: BytesMut,
    /// Offset up to which no terminator can start.
    scanned: usize,
    max_bytes: usize,
}

impl HandshakeBuffer {
    /// Create a buffer that gives up after `max_bytes` without a blank line.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_bytes,
        }
    }

    /// Append a chunk and report whether the connection can be classified.
    ///
    /// # Errors
    ///
    /// [`ProxyError::MalformedHandshake`] if a `GET` head is unparsable or
    /// grows past the size cap. The buffer is emptied.
    pub fn push(&mut self, chunk: &[u8]) -> ProxyResult<HandshakeProgress> {
        self.buf.extend_from_slice(chunk);

        let seen = self.buf.len().min(HANDSHAKE_METHOD_PREFIX.len());
        if self.buf[..seen] != HANDSHAKE_METHOD_PREFIX[..seen] {
            return Ok(HandshakeProgress::Raw(self.buf.split().freeze()));
        }

        let Some(end) = find_terminator(&self.buf, self.scanned) else {
            if self.buf.len() > self.max_bytes {
                self.take();
                return Err(ProxyError::MalformedHandshake(format!(
                    "no end of request head within {} bytes",
                    self.max_bytes
                )));
            }
            self.scanned = self
                .buf
                .len()
                .saturating_sub(HANDSHAKE_TERMINATOR.len() - 1);
            return Ok(HandshakeProgress::Pending);
        };

        match parse_head(&self.buf[..end], end + HANDSHAKE_TERMINATOR.len()) {
            ParseOutcome::Complete(request) if request.declaration().is_some() => {
                Ok(HandshakeProgress::Complete {
                    request,
                    bytes: self.buf.split().freeze(),
                })
            }
            ParseOutcome::Complete(_) => Ok(HandshakeProgress::Raw(self.buf.split().freeze())),
            ParseOutcome::Malformed(reason) => {
                self.take();
                Err(ProxyError::MalformedHandshake(reason))
            }
            ParseOutcome::Incomplete => Ok(HandshakeProgress::Pending),
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain whatever was buffered without classifying it.
    pub fn take(&mut self) -> Bytes {
        self.scanned = 0;
        self.buf.split().freeze()
    }
}

/// Outcome of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Role the connection takes on.
    pub role: Role,
    /// Bytes to write back before anything else, if any.
    pub response: Option<&'static [u8]>,
}

/// Classify a request and authenticate it against the directory.
///
/// On success the directory already records the new server or member.
///
/// # Errors
///
/// [`ProxyError::ChannelBusy`], [`ProxyError::BadToken`] or
/// [`ProxyError::NoSuchChannel`]; the directory is left untouched.
pub fn classify_and_authenticate(
    id: ConnectionId,
    request: &HandshakeRequest,
    directory: &mut ChannelDirectory,
) -> ProxyResult<Admission> {
    let channel = request.path.as_str();
    let role = match request.declaration() {
        Some(Declaration::Server { token, new_token }) => {
            directory.register_server(id, channel, &token, new_token.as_deref())?;
            Role::ServerMember(channel.to_string())
        }
        Some(Declaration::Client { token }) => {
            directory.register_client(id, channel, &token)?;
            Role::ClientMember(channel.to_string())
        }
        None => {
            return Ok(Admission {
                role: Role::RawClient,
                response: None,
            })
        }
    };
    Ok(Admission {
        role,
        response: Some(UPGRADE_RESPONSE),
    })
}

/// Build the rejection written before closing a refused handshake.
pub fn rejection_response(status: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    ))
}

/// Build a member handshake request, as a channel server or client sends it.
pub fn request_bytes(channel: &str, host: &str, authorization: &str) -> Bytes {
    Bytes::from(format!(
        "GET {channel} HTTP/1.1\r\n\
         Upgrade: tcp\r\n\
         Connection: Upgrade\r\n\
         Host: {host}\r\n\
         Origin: http://{host}\r\n\
         Proxy-Authorization: {authorization}\r\n\
         \r\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_request(channel: &str, token: &str, new_token: &str) -> Bytes {
        request_bytes(channel, "localhost", &format!("Server {token} {new_token}"))
    }

    #[test]
    fn test_try_parse_complete_request() {
        let bytes = server_request("/room1", "", "tok");
        let ParseOutcome::Complete(request) = try_parse(&bytes) else {
            panic!("expected complete request");
        };
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/room1");
        assert_eq!(request.http_version, "1.1");
        assert_eq!(request.header("Upgrade"), Some("tcp"));
        assert_eq!(request.header("proxy-authorization"), Some("Server  tok"));
        assert_eq!(request.handshake_len, bytes.len());
    }

    #[test]
    fn test_try_parse_incomplete_and_malformed() {
        assert_eq!(try_parse(b"GET /a HTTP/1.1\r\nHost: x\r\n"), ParseOutcome::Incomplete);
        assert!(matches!(
            try_parse(b"GET /a\r\n\r\n"),
            ParseOutcome::Malformed(_)
        ));
        assert!(matches!(
            try_parse(b"GET /a HTTP/1.1\r\nno colon here\r\n\r\n"),
            ParseOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_declaration_marker() {
        let parse = |auth: &str| {
            let ParseOutcome::Complete(req) = try_parse(&request_bytes("/c", "h", auth)) else {
                panic!("expected complete request");
            };
            req.declaration()
        };

        assert_eq!(
            parse("Server old new"),
            Some(Declaration::Server {
                token: "old".into(),
                new_token: Some("new".into())
            })
        );
        assert_eq!(
            parse("Server"),
            Some(Declaration::Server {
                token: String::new(),
                new_token: None
            })
        );
        assert_eq!(parse("Client tok"), Some(Declaration::Client { token: "tok".into() }));
        assert_eq!(parse("Basic dXNlcjpwYXNz"), None);
        assert_eq!(parse("server lowercase-is-not-a-tag"), None);
    }

    #[test]
    fn test_trailing_space_declares_empty_new_token() {
        let ParseOutcome::Complete(req) = try_parse(&request_bytes("/c", "h", "Server tok ")) else {
            panic!("expected complete request");
        };
        assert_eq!(req.header("proxy-authorization"), Some("Server tok "));
        assert_eq!(
            req.declaration(),
            Some(Declaration::Server {
                token: "tok".into(),
                new_token: Some(String::new())
            })
        );

        let ParseOutcome::Complete(req) =
            try_parse(b"GET /c HTTP/1.1\r\nProxy-Authorization:   Client tok\r\n\r\n")
        else {
            panic!("expected complete request");
        };
        assert_eq!(req.declaration(), Some(Declaration::Client { token: "tok".into() }));
    }

    #[test]
    fn test_request_without_authorization_declares_nothing() {
        let ParseOutcome::Complete(req) =
            try_parse(b"GET /index.html HTTP/1.1\r\nHost: example\r\n\r\n")
        else {
            panic!("expected complete request");
        };
        assert_eq!(req.declaration(), None);
    }

    #[test]
    fn test_buffer_handles_split_handshake_and_leftover() {
        let mut bytes = server_request("/room1", "", "tok").to_vec();
        bytes.extend_from_slice(b"\x00\x00\x00");
        let mut buffer = HandshakeBuffer::new(1024);

        for chunk in bytes[..bytes.len() - 5].chunks(3) {
            assert!(matches!(buffer.push(chunk).unwrap(), HandshakeProgress::Pending));
        }
        match buffer.push(&bytes[bytes.len() - 5..]).unwrap() {
            HandshakeProgress::Complete { request, bytes } => {
                assert_eq!(request.path, "/room1");
                assert_eq!(&bytes[request.handshake_len..], b"\x00\x00\x00");
            }
            other => panic!("expected member handshake, got {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_classifies_non_get_bytes_as_raw_immediately() {
        let mut buffer = HandshakeBuffer::new(1024);
        match buffer.push(b"ping").unwrap() {
            HandshakeProgress::Raw(bytes) => assert_eq!(bytes.as_ref(), b"ping"),
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn test_buffer_waits_on_get_prefix() {
        let mut buffer = HandshakeBuffer::new(1024);
        assert!(matches!(buffer.push(b"GE").unwrap(), HandshakeProgress::Pending));
        assert!(matches!(buffer.push(b"T /x").unwrap(), HandshakeProgress::Pending));
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_buffer_take_drains_pending_bytes() {
        let mut buffer = HandshakeBuffer::new(1024);
        assert!(matches!(buffer.push(b"GET /half").unwrap(), HandshakeProgress::Pending));
        assert_eq!(buffer.take().as_ref(), b"GET /half");
        assert!(buffer.is_empty());
        assert!(buffer.take().is_empty());
    }

    #[test]
    fn test_buffer_tunnels_plain_http_request_raw() {
        let request = b"GET / HTTP/1.1\r\nHost: example\r\n\r\nextra";
        let mut buffer = HandshakeBuffer::new(1024);
        match buffer.push(request).unwrap() {
            HandshakeProgress::Raw(bytes) => assert_eq!(bytes.as_ref(), request),
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn test_buffer_rejects_oversized_head() {
        let mut buffer = HandshakeBuffer::new(32);
        let err = buffer
            .push(b"GET /a HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .unwrap_err();
        assert!(matches!(err, ProxyError::MalformedHandshake(_)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_classify_server_then_client() {
        let mut directory = ChannelDirectory::new(std::iter::empty());
        let ParseOutcome::Complete(server) = try_parse(&server_request("room1", "", "tok")) else {
            panic!("expected complete request");
        };
        let admission =
            classify_and_authenticate(ConnectionId::new(1), &server, &mut directory).unwrap();
        assert_eq!(admission.role, Role::ServerMember("room1".into()));
        assert_eq!(admission.response, Some(UPGRADE_RESPONSE));

        let ParseOutcome::Complete(client) =
            try_parse(&request_bytes("room1", "h", "Client tok"))
        else {
            panic!("expected complete request");
        };
        let admission =
            classify_and_authenticate(ConnectionId::new(2), &client, &mut directory).unwrap();
        assert_eq!(admission.role, Role::ClientMember("room1".into()));
        assert_eq!(directory.channel_of(ConnectionId::new(2)), Some("room1"));
    }

    #[test]
    fn test_classify_bad_client_token_leaves_no_membership() {
        let mut directory = ChannelDirectory::new([("/".to_string(), "root".to_string())]);
        directory
            .register_server(ConnectionId::new(1), "/", "root", Some("clients"))
            .unwrap();
        let ParseOutcome::Complete(client) = try_parse(&request_bytes("/", "h", "Client nope"))
        else {
            panic!("expected complete request");
        };
        let err =
            classify_and_authenticate(ConnectionId::new(4), &client, &mut directory).unwrap_err();
        assert!(matches!(err, ProxyError::BadToken { .. }));
        assert_eq!(directory.channel_of(ConnectionId::new(4)), None);
    }

    #[test]
    fn test_rejection_response_is_http() {
        let bytes = rejection_response("409 Conflict");
        assert!(bytes.starts_with(b"HTTP/1.1 409 Conflict\r\n"));
        assert!(bytes.ends_with(b"\r\n\r\n"));
    }
}
