use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpStream, lookup_host};

use crate::skein::{
    config::Config,
    connection::Connection,
    transport::{Backend, Uri, socket},
};

const DEFAULT_PORT: u16 = 8888;

/// Envelope relay across a WireGuard interface that is configured out of
/// band. The peer address resolves inside the wg network; once the TCP
/// stream is up this is the plain socket codec, with the tunnel providing
/// the encryption layer.
pub struct WgBackend;

#[async_trait]
impl Backend for WgBackend {
    fn scheme(&self) -> &'static str {
        "wg"
    }

    async fn connect(&self, uri: &Uri, _cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        let addr = resolve(uri).await?;
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("wg: dial {}", addr))?;
        tcp.set_nodelay(true)?;

        tracing::info!(uri = %uri, peer = %addr, "wg: connected");

        let (conn, io) = Connection::new(&uri.raw);
        socket::wire_stream(tcp, io, conn.clone());
        Ok(conn)
    }
}

/// Resolve the peer before dialing so name lookups never ride the data
/// path of the wg network itself.
async fn resolve(uri: &Uri) -> anyhow::Result<SocketAddr> {
    let target = uri.address(DEFAULT_PORT);
    lookup_host(&target)
        .await
        .with_context(|| format!("wg: resolve {}", target))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("wg: no address for {}", target))
}
