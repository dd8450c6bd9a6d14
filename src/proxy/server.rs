//! TCP listener and dispatcher loop.
//!
//! [`ProxyServer::bind`] opens the listener; [`ProxyServer::run`] spawns the
//! accept loop and then runs the dispatcher on the calling task until the
//! listener fails or a [`ProxyHandle`] asks for shutdown. Either way every
//! tracked connection is destroyed before `run` returns.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::CLOSE_FLUSH_TIMEOUT;
use crate::error::ProxyError;

use super::connection::TcpConnection;
use super::dispatcher::Dispatcher;
use super::events::ProxyEvent;
use super::registry::ConnectionId;

/// Requests shutdown of a running [`ProxyServer`].
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    shutdown: CancellationToken,
}

impl ProxyHandle {
    /// Stop accepting and close every connection. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A bound, not yet running, proxy.
#[derive(Debug)]
pub struct ProxyServer {
    config: Config,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Validate `config` and bind its listening address.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind((config.bind.as_str(), config.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", config.bind, config.port))?;

        Ok(Self {
            config,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS cannot report the address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Handle for stopping the server from another task.
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept and route until shutdown or a listener failure.
    ///
    /// # Errors
    ///
    /// Returns the listener error if accepting failed; all connections have
    /// been closed by then.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            listener,
            shutdown,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            log::info!("[Proxy] Listening on {addr}");
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ProxyEvent>();
        let accept_handle = tokio::spawn(accept_loop(listener, event_tx, shutdown.clone()));
        let mut dispatcher = Dispatcher::new(&config);

        let result = loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("[Proxy] Shutdown requested");
                    break Ok(());
                }
                event = event_rx.recv() => match event {
                    Some(ProxyEvent::ListenerFailed(e)) => {
                        log::error!("[Proxy] Listener failed: {e}");
                        break Err(anyhow::Error::new(ProxyError::Listener(e))
                            .context("Proxy listener stopped"));
                    }
                    Some(event) => handle_event(&mut dispatcher, event),
                    None => break Ok(()),
                },
            }
        };

        shutdown.cancel();
        accept_handle.abort();
        dispatcher.shutdown();
        result
    }
}

fn handle_event(dispatcher: &mut Dispatcher, event: ProxyEvent) {
    match event {
        ProxyEvent::Accepted { id, conn } => {
            if let Err(e) = dispatcher.accept(id, Box::new(conn)) {
                log::warn!("[Conn {id}] {e}");
            }
        }
        ProxyEvent::Data { id, bytes } => dispatcher.receive(id, bytes),
        ProxyEvent::Closed { id } => dispatcher.close(id),
        ProxyEvent::Failed { id, error } => dispatcher.transport_failed(id, error),
        ProxyEvent::ListenerFailed(_) => {}
    }
}

/// Accept loop: runs as a tokio task, assigning ids from 1 upwards.
async fn accept_loop(
    listener: TcpListener,
    event_tx: UnboundedSender<ProxyEvent>,
    shutdown: CancellationToken,
) {
    let mut next_id: u64 = 1;

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let id = ConnectionId::new(next_id);
                next_id += 1;
                log::info!("[Conn {id}] Accepted from {addr}");

                let (conn, reader) =
                    TcpConnection::open(id, stream, &shutdown, CLOSE_FLUSH_TIMEOUT);
                if event_tx.send(ProxyEvent::Accepted { id, conn }).is_err() {
                    log::warn!("[Proxy] Dispatcher gone, stopping accept loop");
                    break;
                }
                reader.spawn(event_tx.clone());
            }
            Err(e) => {
                let _ = event_tx.send(ProxyEvent::ListenerFailed(e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;

    fn loopback() -> Config {
        Config {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = Config {
            max_frame_bytes: 4,
            ..loopback()
        };
        assert!(ProxyServer::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let server = ProxyServer::bind(loopback()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Give the dispatcher a moment to register the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        assert!(handle.is_shutdown());

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("Server did not stop")
            .unwrap()
            .unwrap();

        let mut buf = Vec::new();
        // EOF or reset both mean the proxy closed its end.
        let _eof = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
            .await
            .expect("Connection was not closed");
        assert!(buf.is_empty());
    }
}
