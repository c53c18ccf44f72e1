use std::{io, sync::Arc};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::skein::{
    connection::{Connection, ConnectionIo},
    envelope::{self, Envelope, EnvelopeError, Ping, kind},
    transport::KEEPALIVE_INTERVAL,
};

/// Wire a byte stream to a connection's queues: one task drains the outbound
/// queue onto the stream, one fills the inbound queue from it. Either task
/// hitting an error tears the connection down.
///
/// `keepalive` sends a ping after that much outbound silence; pass `None`
/// for transports that must stay quiet.
pub fn wire_connection<S>(
    stream: S,
    io: ConnectionIo,
    conn: Arc<Connection>,
    keepalive: Option<std::time::Duration>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let ConnectionIo {
        send_rx, recv_tx, ..
    } = io;

    tokio::spawn(outbound_drain(writer, send_rx, conn.clone(), keepalive));
    tokio::spawn(inbound_fill(reader, recv_tx, conn));
}

pub fn wire_stream<S>(stream: S, conn_io: ConnectionIo, conn: Arc<Connection>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    wire_connection(stream, conn_io, conn, Some(KEEPALIVE_INTERVAL));
}

async fn outbound_drain<W>(
    mut writer: W,
    mut send_rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    conn: Arc<Connection>,
    keepalive: Option<std::time::Duration>,
) where
    W: AsyncWrite + Send + Unpin,
{
    // A far-future interval stands in for "no keepalive" so the select stays
    // a single shape.
    let period = keepalive.unwrap_or(std::time::Duration::from_secs(60 * 60 * 24 * 365));
    let mut idle = tokio::time::interval(period);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    idle.tick().await; // first tick fires immediately

    let mut closed = conn.closed();
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
            env = send_rx.recv() => {
                let Some(env) = env else { break };
                idle.reset();
                if let Err(err) = envelope::write_envelope(&mut writer, &env).await {
                    tracing::debug!(uri = %conn.uri, err = %err, "transport: write failed");
                    break;
                }
            }
            _ = idle.tick() => {
                if keepalive.is_none() {
                    continue;
                }
                let ping = Ping { nonce: rand::thread_rng().r#gen() };
                let env = match Envelope::new(kind::PING, &ping) {
                    Ok(env) => env,
                    Err(_) => continue,
                };
                if let Err(err) = envelope::write_envelope(&mut writer, &env).await {
                    tracing::debug!(uri = %conn.uri, err = %err, "transport: keepalive failed");
                    break;
                }
            }
        }
    }
    conn.cleanup();
}

async fn inbound_fill<R>(
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
            Ok(env) => {
                if recv_tx.send(env).is_err() {
                    break;
                }
            }
            Err(EnvelopeError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                // Peer hung up.
                break;
            }
            Err(err) => {
                tracing::debug!(uri = %conn.uri, err = %err, "transport: read failed");
                break;
            }
        }
    }
    conn.cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_envelopes_hit_the_wire() {
        let (conn, io) = Connection::stub();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        wire_connection(ours, io, conn.clone(), None);

        let env = Envelope::with_id(7, kind::PING, &Ping { nonce: 42 }).unwrap();
        assert!(conn.send(env));

        let got = envelope::read_envelope(&mut theirs).await.unwrap();
        assert_eq!(got.id, 7);
        assert_eq!(got.kind, kind::PING);
        assert_eq!(got.decode::<Ping>().unwrap().nonce, 42);
    }

    #[tokio::test]
    async fn inbound_envelopes_reach_the_queue() {
        let (conn, io) = Connection::stub();
        let mut recv = conn.take_recv().unwrap();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        wire_connection(ours, io, conn, None);

        let env = Envelope::with_id(3, kind::TUNNEL_CLOSE, &serde_json::json!({"tunnel_id": 1}))
            .unwrap();
        envelope::write_envelope(&mut theirs, &env).await.unwrap();

        let got = recv.recv().await.unwrap();
        assert_eq!(got.id, 3);
        assert_eq!(got.kind, kind::TUNNEL_CLOSE);
    }

    #[tokio::test]
    async fn peer_hangup_cleans_connection() {
        let (conn, io) = Connection::stub();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        wire_connection(ours, io, conn.clone(), None);

        let mut closed = conn.closed();
        drop(theirs);
        closed.changed().await.unwrap();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn cleanup_severs_the_stream() {
        let (conn, io) = Connection::stub();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        wire_connection(ours, io, conn.clone(), None);

        conn.cleanup();
        // The queue still accepts the frame, but both pumps exit and drop
        // their stream halves; the peer sees EOF instead of the envelope.
        assert!(conn.send(Envelope::new(kind::PING, &Ping { nonce: 9 }).unwrap()));
        assert!(envelope::read_envelope(&mut theirs).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_sends_keepalives() {
        let (conn, io) = Connection::stub();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        wire_connection(ours, io, conn, Some(std::time::Duration::from_secs(30)));

        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        let got = envelope::read_envelope(&mut theirs).await.unwrap();
        assert_eq!(got.kind, kind::PING);
    }
}
