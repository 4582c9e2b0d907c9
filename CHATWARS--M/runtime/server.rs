use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use chatwars_commands::KeyId;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::InputBackend,
    events::Transition,
    wire::{FrameReader, WireError},
};

/// TCP endpoint applying remote key edges to a local backend.
pub struct RemoteInputServer {
    listener: TcpListener,
    backend: Arc<dyn InputBackend>,
}

impl RemoteInputServer {
    /// Binds the listening socket.
    pub async fn bind(addr: &str, backend: Arc<dyn InputBackend>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding remote input server on {addr}"))?;
        Ok(Self { listener, backend })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop on a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "remote input server listening");
        loop {
            let (stream, peer) = self.listener.accept().await.context("accepting connection")?;
            let backend = Arc::clone(&self.backend);
            tokio::spawn(async move {
                serve_connection(stream, peer, backend).await;
            });
        }
    }
}

/// Applies frames from one client. Keys the client left pressed are
/// released when the connection ends, however it ends.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, backend: Arc<dyn InputBackend>) {
    debug!(%peer, "remote input connection opened");
    let mut reader = FrameReader::new(stream);
    let mut last_seq = None;
    let mut held: HashSet<(u8, KeyId)> = HashSet::new();
    loop {
        let message = match reader.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(WireError::UnsupportedVersion(v)) => {
                warn!(%peer, version = v, "unsupported wire version, closing connection");
                break;
            }
            Err(err) => {
                warn!(%peer, error = %err, "dropping remote input connection");
                break;
            }
        };
        if last_seq.is_some_and(|seq| message.seq <= seq) {
            warn!(%peer, seq = message.seq, "out of order frame");
        }
        last_seq = Some(message.seq);
        let key = KeyId::new(message.key);
        match message.transition {
            Transition::Press => {
                held.insert((message.player_index, key.clone()));
            }
            Transition::Release => {
                held.remove(&(message.player_index, key.clone()));
            }
        }
        if let Err(err) = backend
            .apply(message.player_index, &key, message.transition)
            .await
        {
            warn!(%peer, %key, transition = message.transition.label(), error = %err, "remote input not applied");
        }
    }
    if !held.is_empty() {
        info!(%peer, keys = held.len(), "releasing keys held by closed connection");
    }
    for (player_index, key) in held {
        if let Err(err) = backend.apply(player_index, &key, Transition::Release).await {
            warn!(%peer, %key, error = %err, "held key not released");
        }
    }
    debug!(%peer, "remote input connection closed");
}
