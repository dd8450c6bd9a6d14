//! Channel directory: channel → server/tokens, client → channel.
//!
//! The directory is the authority for admission. Each admission call checks
//! its precondition and mutates in one `&mut self` step, and the directory is
//! owned by the single dispatcher task, so two servers can never both win the
//! same channel.
//!
//! Every channel carries two secrets. The server token comes from
//! configuration (empty for a channel first created by a server) and is never
//! changed at runtime. The client token is installed by whichever server
//! registers and is unset until then, so clients cannot join a channel no
//! server has opened yet. A channel entry outlives its server: the server slot
//! is vacated and the last client token is kept.

use std::collections::HashMap;

use crate::constants::ROOT_CHANNEL;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::registry::ConnectionId;

/// Directory entry for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    /// Connection currently serving the channel.
    pub server: Option<ConnectionId>,
    /// Token a server must present to register.
    pub server_token: String,
    /// Token clients must present; `None` until a server installs one.
    pub client_token: Option<String>,
}

impl Channel {
    fn configured(server_token: String) -> Self {
        Self {
            server: None,
            server_token,
            client_token: None,
        }
    }
}

/// Effect of releasing a connection from the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    /// Channel whose server slot was vacated.
    pub served: Option<String>,
    /// Channel the connection was a client member of.
    pub member_of: Option<String>,
}

/// Authoritative table of channels and client memberships.
#[derive(Debug)]
pub struct ChannelDirectory {
    channels: HashMap<String, Channel>,
    membership: HashMap<ConnectionId, String>,
}

impl ChannelDirectory {
    /// Create a directory with preconfigured server tokens.
    ///
    /// The root channel always exists, with an empty server token unless
    /// configured.
    pub fn new(preconfigured: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut channels: HashMap<String, Channel> = preconfigured
            .into_iter()
            .map(|(name, token)| (name, Channel::configured(token)))
            .collect();
        channels.entry(ROOT_CHANNEL.to_string()).or_default();

        Self {
            channels,
            membership: HashMap::new(),
        }
    }

    /// Register `id` as the server of `name`.
    ///
    /// A channel not yet known is created with an empty server token. On
    /// success `new_token` becomes the client token; `None` keeps the client
    /// token left by the previous server.
    ///
    /// # Errors
    ///
    /// [`ProxyError::ChannelBusy`] if a server is already registered (checked
    /// first), [`ProxyError::BadToken`] if `presented` is not the server token.
    pub fn register_server(
        &mut self,
        id: ConnectionId,
        name: &str,
        presented: &str,
        new_token: Option<&str>,
    ) -> ProxyResult<()> {
        let channel = self.channels.entry(name.to_string()).or_default();

        if channel.server.is_some() {
            return Err(ProxyError::ChannelBusy {
                channel: name.to_string(),
            });
        }
        if channel.server_token != presented {
            return Err(ProxyError::BadToken {
                channel: name.to_string(),
            });
        }

        channel.server = Some(id);
        if let Some(token) = new_token {
            channel.client_token = Some(token.to_string());
        }
        Ok(())
    }

    /// Admit `id` as a client of `name`.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NoSuchChannel`] for an unknown channel,
    /// [`ProxyError::BadToken`] on token mismatch or when no server has
    /// installed a client token yet. No membership is recorded on failure.
    pub fn register_client(&mut self, id: ConnectionId, name: &str, presented: &str) -> ProxyResult<()> {
        let channel = self.channels.get(name).ok_or_else(|| ProxyError::NoSuchChannel {
            channel: name.to_string(),
        })?;
        if channel.client_token.as_deref() != Some(presented) {
            return Err(ProxyError::BadToken {
                channel: name.to_string(),
            });
        }
        self.membership.insert(id, name.to_string());
        Ok(())
    }

    /// Server currently registered for `name`.
    pub fn server_of(&self, name: &str) -> Option<ConnectionId> {
        self.channels.get(name).and_then(|c| c.server)
    }

    /// Channel `id` is a client member of.
    pub fn channel_of(&self, id: ConnectionId) -> Option<&str> {
        self.membership.get(&id).map(String::as_str)
    }

    /// Look up a channel entry.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Drop every entry that refers to `id`.
    pub fn release_connection(&mut self, id: ConnectionId) -> Released {
        let served = self
            .channels
            .iter_mut()
            .find(|(_, channel)| channel.server == Some(id))
            .map(|(name, channel)| {
                channel.server = None;
                name.clone()
            });
        let member_of = self.membership.remove(&id);
        Released { served, member_of }
    }
}

impl Default for ChannelDirectory {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}
