//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and drives each one with [`serve_connection`]:
//! requests are read in order, handed to a bounded pool of concurrent handler
//! tasks, and their responses written back in request order even when the
//! client pipelines.

mod connection;
pub mod reader;
pub mod sequencer;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::router::Registry;

pub use connection::serve_connection;
pub use reader::{ConnectionReader, RequestIds};
pub use sequencer::ResponseSequencer;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The pipehttp HTTP server.
///
/// Binds to a TCP address and serves a [`Registry`] of handlers.
///
/// # Examples
///
/// ```rust,no_run
/// use pipehttp::{Registry, Response, StatusCode};
/// use pipehttp::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut registry = Registry::new();
///     registry.get("/", |_ctx| async { Response::new(StatusCode::Ok).body("Hello!") });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(registry).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the server to the given TCP address with the default
    /// [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(ServerConfig::default()),
        })
    }

    /// Replaces the configuration used for connections accepted from now on.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if `config` fails validation.
    pub fn with_config(mut self, config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        self.config = Arc::new(config);
        Ok(self)
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts accepting connections and serving `registry`.
    ///
    /// Each connection runs on its own task. Handlers across all connections
    /// share a pool of `max_concurrent_handlers` permits.
    ///
    /// This method runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, registry: Registry) -> Result<(), ServerError> {
        let registry = Arc::new(registry);
        let workers = Arc::new(Semaphore::new(self.config.max_concurrent_handlers));
        info!(address = %self.local_addr, routes = registry.len(), "pipehttp listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
            }

            let registry = Arc::clone(&registry);
            let config = Arc::clone(&self.config);
            let workers = Arc::clone(&workers);

            tokio::spawn(async move {
                match serve_connection(stream, peer_addr, registry, config, workers).await {
                    Ok(()) => debug!(peer = %peer_addr, "connection closed"),
                    Err(e) => warn!(peer = %peer_addr, error = %e, "connection closed with error"),
                }
            });
        }
    }
}
