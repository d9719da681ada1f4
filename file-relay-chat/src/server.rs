//! Accepts paired connections and starts a session for each pair.
//!
//! Clients open their text connection first and their file connection second;
//! the Nth accepted text connection is paired with the Nth accepted file
//! connection.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig, registry::Registry, relay::DEFAULT_MAX_UPLOAD_BYTES, session::Session,
};

pub struct Server {
    text_listener: TcpListener,
    file_listener: TcpListener,
    registry: Arc<Registry>,
    max_upload_bytes: u64,
}

struct ConnectionPair {
    text: TcpStream,
    file: TcpStream,
    peer: SocketAddr,
}

impl Server {
    pub fn new(text_listener: TcpListener, file_listener: TcpListener) -> Self {
        Self {
            text_listener,
            file_listener,
            registry: Arc::new(Registry::new()),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let text_listener = TcpListener::bind(config.text_addr())
            .await
            .with_context(|| format!("failed to bind text channel on {}", config.text_addr()))?;
        let file_listener = TcpListener::bind(config.file_addr())
            .await
            .with_context(|| format!("failed to bind file channel on {}", config.file_addr()))?;

        Ok(Self::new(text_listener, file_listener).with_max_upload_bytes(config.max_upload_bytes))
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: u64) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn text_addr(&self) -> std::io::Result<SocketAddr> {
        self.text_listener.local_addr()
    }

    pub fn file_addr(&self) -> std::io::Result<SocketAddr> {
        self.file_listener.local_addr()
    }

    /// Handle on the live sessions, usable while the server runs.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            text_listener,
            file_listener,
            registry,
            max_upload_bytes,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry).await;
                    break;
                }
                pair = accept_pair(&text_listener, &file_listener) => {
                    if let Some(pair) = pair {
                        start_session(pair, &registry, max_upload_bytes).await;
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(registry: &Registry) {
    info!("server shutting down");
    registry.close_all().await;
}

// A failed accept only costs the affected pair; the loop keeps serving.
async fn accept_pair(text: &TcpListener, file: &TcpListener) -> Option<ConnectionPair> {
    let (text_stream, peer) = match text.accept().await {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = ?err, "failed to accept text connection");
            return None;
        }
    };

    match file.accept().await {
        Ok((file_stream, file_peer)) => {
            if file_peer.ip() != peer.ip() {
                warn!(%peer, %file_peer, "paired connections come from different hosts");
            }
            Some(ConnectionPair {
                text: text_stream,
                file: file_stream,
                peer,
            })
        }
        Err(err) => {
            warn!(%peer, error = ?err, "failed to accept file connection; dropping text connection");
            None
        }
    }
}

async fn start_session(pair: ConnectionPair, registry: &Arc<Registry>, max_upload_bytes: u64) {
    let ConnectionPair { text, file, peer } = pair;
    let (text_reader, text_writer) = text.into_split();
    let (file_reader, file_writer) = file.into_split();

    let session = Session::new(registry.next_id(), text_writer, file_writer);
    // Registered before its loop starts so no concurrent broadcast misses it.
    registry.register(Arc::clone(&session)).await;
    info!(session = session.id(), %peer, "accepted connection pair");

    tokio::spawn(session.run(
        BufReader::new(text_reader),
        BufReader::new(file_reader),
        Arc::clone(registry),
        max_upload_bytes,
    ));
}
