use std::{io, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::skein::{
    config::Config,
    connection::{Connection, ConnectionIo},
    envelope::{self, Envelope, EnvelopeError, Ping, kind},
    transport::{Backend, Uri},
};

const DEFAULT_PORT: u16 = 9898;

/// Liveness probe cadence between pivot peers. Slower than the ordinary
/// stream keepalive; a hop failure is reported upstream, not retried here.
pub const PEER_PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Dials another node's pivot listener over TCP. Envelopes flow as on any
/// stream transport, but liveness uses peer pings whose pongs are filtered
/// out before the inbound queue, so the dispatcher never sees them.
pub struct PivotBackend;

#[async_trait]
impl Backend for PivotBackend {
    fn scheme(&self) -> &'static str {
        "pivot"
    }

    async fn connect(&self, uri: &Uri, _cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        let addr = uri.address(DEFAULT_PORT);
        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("pivot: dial {}", addr))?;
        tcp.set_nodelay(true)?;

        tracing::info!(uri = %uri, "pivot: connected to upstream peer");

        let (conn, io) = Connection::new(&uri.raw);
        wire_peer(tcp, io, conn.clone());
        Ok(conn)
    }
}

pub fn wire_peer<S>(stream: S, io: ConnectionIo, conn: Arc<Connection>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let ConnectionIo { send_rx, recv_tx } = io;
    tokio::spawn(outbound(writer, send_rx, conn.clone()));
    tokio::spawn(inbound(reader, recv_tx, conn));
}

async fn outbound<W>(
    mut writer: W,
    mut send_rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    conn: Arc<Connection>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut idle = tokio::time::interval(PEER_PING_INTERVAL);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    idle.tick().await;

    let mut closed = conn.closed();
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
            env = send_rx.recv() => {
                let Some(env) = env else { break };
                idle.reset();
                if let Err(err) = envelope::write_envelope(&mut writer, &env).await {
                    tracing::debug!(uri = %conn.uri, err = %err, "pivot: write failed");
                    break;
                }
            }
            _ = idle.tick() => {
                let ping = Ping { nonce: rand::thread_rng().r#gen() };
                let env = match Envelope::new(kind::PIVOT_PEER_PING, &ping) {
                    Ok(env) => env,
                    Err(_) => continue,
                };
                if let Err(err) = envelope::write_envelope(&mut writer, &env).await {
                    tracing::debug!(uri = %conn.uri, err = %err, "pivot: peer ping failed");
                    break;
                }
            }
        }
    }
    conn.cleanup();
}

async fn inbound<R>(
    mut reader: R,
    recv_tx: tokio::sync::mpsc::UnboundedSender<Envelope>,
    conn: Arc<Connection>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut closed = conn.closed();
    loop {
        let res = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            res = envelope::read_envelope(&mut reader) => res,
        };
        match res {
            Ok(env) if env.kind == kind::PIVOT_PEER_PING => {
                // Pong from the upstream peer; consumed here.
                tracing::trace!(uri = %conn.uri, "pivot: peer pong");
            }
            Ok(env) => {
                if recv_tx.send(env).is_err() {
                    break;
                }
            }
            Err(EnvelopeError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                tracing::debug!(uri = %conn.uri, err = %err, "pivot: read failed");
                break;
            }
        }
    }
    conn.cleanup();
}
