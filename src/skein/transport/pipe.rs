use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::skein::{
    config::Config,
    connection::Connection,
    transport::{Backend, Uri, socket},
};

/// Envelope relay over a local pipe: a Unix domain socket, or a named pipe
/// on Windows. Used to reach a peer on the same host without touching the
/// network stack. No keepalive; the kernel reports a dead peer instantly.
pub struct PipeBackend;

#[async_trait]
impl Backend for PipeBackend {
    fn scheme(&self) -> &'static str {
        "pipe"
    }

    #[cfg(unix)]
    async fn connect(&self, uri: &Uri, _cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        let path = pipe_path(uri);
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .with_context(|| format!("pipe: dial {}", path))?;

        tracing::info!(uri = %uri, path = %path, "pipe: connected");

        let (conn, io) = Connection::new(&uri.raw);
        socket::wire_connection(stream, io, conn.clone(), None);
        Ok(conn)
    }

    #[cfg(windows)]
    async fn connect(&self, uri: &Uri, _cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let name = format!(r"\\.\pipe\{}", uri.host);
        let stream = loop {
            match ClientOptions::new().open(&name) {
                Ok(s) => break s,
                // Pipe exists but every instance is busy; retry shortly.
                Err(err) if err.raw_os_error() == Some(231) => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("pipe: open {}", name));
                }
            }
        };

        tracing::info!(uri = %uri, name = %name, "pipe: connected");

        let (conn, io) = Connection::new(&uri.raw);
        socket::wire_connection(stream, io, conn.clone(), None);
        Ok(conn)
    }
}

/// `pipe://host/rest` maps to the filesystem path `/host/rest`; a bare
/// `pipe://name` becomes a path relative to the working directory.
#[cfg(unix)]
fn pipe_path(uri: &Uri) -> String {
    if uri.path.is_empty() {
        uri.host.clone()
    } else {
        format!("/{}{}", uri.host, uri.path)
    }
}
