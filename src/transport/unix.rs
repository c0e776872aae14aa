//! Unix domain socket listener for host-local callers

use super::host::Host;
use crate::dispatcher::SessionOrigin;
use crate::error::{GatewayError, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;

/// Accept side of the framed transport
pub struct UnixListener {
    inner: tokio::net::UnixListener,
}

impl UnixListener {
    /// Bind to a path. Removes an existing socket file if present.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let inner = tokio::net::UnixListener::bind(path)
            .map_err(|e| GatewayError::Transport(format!("{}: {}", path.display(), e)))?;
        Ok(Self { inner })
    }

    /// Accept connections forever, one session per connection
    pub async fn serve(self, host: Arc<Host>, origin: SessionOrigin) -> Result<()> {
        loop {
            let (stream, _addr) = self
                .inner
                .accept()
                .await
                .map_err(|e| GatewayError::Transport(format!("Accept failed: {}", e)))?;

            let host = host.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                host.serve_framed(reader, writer, origin).await;
            });
        }
    }
}

/// Connect to a host socket, returning the split stream
pub async fn connect(
    path: impl AsRef<Path>,
) -> Result<(
    tokio::net::unix::OwnedReadHalf,
    tokio::net::unix::OwnedWriteHalf,
)> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| GatewayError::Transport(format!("{}: {}", path.display(), e)))?;
    Ok(stream.into_split())
}
