use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use crate::skein::{
    bufpool::BufPool,
    connection::Connection,
    envelope::{Envelope, TunnelData, kind},
};

/// Tuning knobs for tunnel sequencing. Observed defaults from the original
/// design, carried as configuration rather than hard invariants.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Out-of-order cache entries tolerated before a resend request.
    pub resend_threshold: usize,
    /// Delay between flushing the last byte and closing the sink, so
    /// in-flight frames can finish on slower transports.
    pub grace_close: Duration,
    /// Chunk size for the outbound copy loop.
    pub chunk_size: usize,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            resend_threshold: 3,
            grace_close: Duration::from_millis(200),
            chunk_size: 32 * 1024,
        }
    }
}

pub type TunnelSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Receive-side state: the reassembly cache and the sink it drains into.
/// One lock covers all three so the read sequence only advances under the
/// same guard that writes the sink.
struct Reassembly {
    read_seq: u64,
    cache: BTreeMap<u64, Vec<u8>>,
    sink: TunnelSink,
    /// Set when a resend request has been emitted; cleared once the cache
    /// drains back below the threshold.
    resend_sent: bool,
}

/// Send-side state: the next write sequence and the retransmit buffer,
/// pruned by piggybacked acks.
struct Outbound {
    write_seq: u64,
    buffer: BTreeMap<u64, TunnelData>,
}

/// A sequenced duplex byte-stream multiplexed inside a Connection.
pub struct Tunnel {
    pub id: u64,
    opts: TunnelOptions,
    reassembly: Mutex<Reassembly>,
    outbound: std::sync::Mutex<Outbound>,
    read_seq_hint: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(id: u64, sink: TunnelSink, opts: TunnelOptions) -> Self {
        Self {
            id,
            opts,
            reassembly: Mutex::new(Reassembly {
                read_seq: 0,
                cache: BTreeMap::new(),
                sink,
                resend_sent: false,
            }),
            outbound: std::sync::Mutex::new(Outbound {
                write_seq: 0,
                buffer: BTreeMap::new(),
            }),
            read_seq_hint: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn read_sequence(&self) -> u64 {
        self.read_seq_hint.load(Ordering::Acquire)
    }

    pub fn write_sequence(&self) -> u64 {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).write_seq
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Handle one inbound data frame for this tunnel.
    ///
    /// Frames may arrive in any order; the cache bridges gaps and the sink
    /// only ever sees bytes in sequence. Returns `true` when the frame
    /// carried the close flag.
    pub async fn handle_data(&self, conn: &Connection, td: TunnelData) -> bool {
        let closing = td.closed;

        // Acks piggybacked on inbound frames prune our retransmit buffer;
        // a resend flag replays it instead.
        if td.resend {
            self.service_resend(conn, td.ack);
            return closing;
        }
        self.prune_retransmit(td.ack);

        let mut r = self.reassembly.lock().await;

        if td.sequence < r.read_seq {
            // Stale retransmit; this slot was already consumed.
            tracing::trace!(tunnel = self.id, seq = td.sequence, "tunnel: stale frame dropped");
            return closing;
        }
        if !td.data.is_empty() || td.sequence >= r.read_seq {
            r.cache.insert(td.sequence, td.data);
        }

        // Drain every in-order chunk to the sink.
        loop {
            let next = r.read_seq;
            let Some(chunk) = r.cache.remove(&next) else { break };
            if let Err(err) = r.sink.write_all(&chunk).await {
                tracing::debug!(tunnel = self.id, err = %err, "tunnel: sink write failed");
                self.closed.store(true, Ordering::Release);
                break;
            }
            r.read_seq += 1;
        }
        let _ = r.sink.flush().await;
        self.read_seq_hint.store(r.read_seq, Ordering::Release);

        if r.cache.len() <= self.opts.resend_threshold {
            r.resend_sent = false;
        }

        // A growing cache means a frame was likely lost in transit; ask the
        // peer to retransmit from our read sequence. One request per gap.
        if r.cache.len() > self.opts.resend_threshold && !r.resend_sent {
            r.resend_sent = true;
            let req = TunnelData {
                tunnel_id: self.id,
                sequence: self.write_sequence(),
                ack: r.read_seq,
                data: Vec::new(),
                closed: false,
                resend: true,
            };
            tracing::debug!(tunnel = self.id, ack = req.ack, "tunnel: requesting resend");
            conn.request_resend(&req);
        }

        closing
    }

    /// Queue one outbound chunk: assigns the next write sequence, remembers
    /// the frame for retransmission, and piggybacks our read sequence.
    pub async fn send_data(&self, conn: &Connection, data: Vec<u8>) -> bool {
        let td = {
            let mut out = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            let td = TunnelData {
                tunnel_id: self.id,
                sequence: out.write_seq,
                ack: self.read_seq_hint.load(Ordering::Acquire),
                data,
                closed: false,
                resend: false,
            };
            out.buffer.insert(td.sequence, td.clone());
            out.write_seq += 1;
            td
        };
        match Envelope::new(kind::TUNNEL_DATA, &td) {
            Ok(env) => conn.send(env),
            Err(err) => {
                tracing::warn!(tunnel = self.id, err = %err, "tunnel: encode frame failed");
                false
            }
        }
    }

    /// Notify the peer this tunnel is done. The caller removes the tunnel
    /// from the connection's registry.
    pub fn send_close(&self, conn: &Connection) {
        let td = TunnelData {
            tunnel_id: self.id,
            sequence: self.write_sequence(),
            ack: self.read_seq_hint.load(Ordering::Acquire),
            data: Vec::new(),
            closed: true,
            resend: false,
        };
        if let Ok(env) = Envelope::new(kind::TUNNEL_DATA, &td) {
            conn.send(env);
        }
    }

    /// Close the sink after the grace delay, letting in-flight frames finish
    /// transmission first.
    pub async fn shutdown_sink(&self) {
        tokio::time::sleep(self.opts.grace_close).await;
        let mut r = self.reassembly.lock().await;
        let _ = r.sink.shutdown().await;
    }

    fn prune_retransmit(&self, ack: u64) {
        let mut out = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        out.buffer.retain(|seq, _| *seq >= ack);
    }

    /// Replay buffered outbound frames from the peer's read sequence.
    fn service_resend(&self, conn: &Connection, from: u64) {
        let frames: Vec<TunnelData> = {
            let out = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            out.buffer.range(from..).map(|(_, td)| td.clone()).collect()
        };
        tracing::debug!(tunnel = self.id, from, count = frames.len(), "tunnel: servicing resend");
        for td in frames {
            if let Ok(env) = Envelope::new(kind::TUNNEL_DATA, &td) {
                if !conn.send(env) {
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    async fn cache_len(&self) -> usize {
        self.reassembly.lock().await.cache.len()
    }
}

/// Spawn the outbound copy loop: reads from `source` in pooled chunks and
/// ships them as sequenced frames. Ends on EOF or connection loss, then
/// sends the close notification and removes the tunnel.
pub fn spawn_copy_loop<R>(
    conn: Arc<Connection>,
    tunnel: Arc<Tunnel>,
    mut source: R,
    pool: Arc<BufPool>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let chunk = tunnel.opts.chunk_size;
        loop {
            let mut buf = pool.get(chunk);
            buf.resize(chunk, 0);
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    let data = buf.to_vec();
                    pool.put(buf);
                    if !tunnel.send_data(&conn, data).await {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(tunnel = tunnel.id, err = %err, "tunnel: source read failed");
                    break;
                }
            }
            if tunnel.is_closed() {
                break;
            }
        }
        if tunnel.mark_closed() {
            tunnel.send_close(&conn);
        }
        conn.remove_tunnel(tunnel.id).await;
        tunnel.shutdown_sink().await;
    })
}

/// Attach a fresh in-memory duplex to a tunnel, yielding a byte stream the
/// caller can read and write like a socket. Bytes written to the stream are
/// shipped as sequenced frames; bytes delivered in order pop out of reads.
///
/// This is how a Comm session rides on a tunnel.
pub fn attach_stream(
    conn: Arc<Connection>,
    id: u64,
    opts: TunnelOptions,
    pool: Arc<BufPool>,
) -> (Arc<Tunnel>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let (read_half, write_half) = tokio::io::split(remote);
    let tunnel = Arc::new(Tunnel::new(id, Box::new(write_half), opts));
    spawn_copy_loop(conn, tunnel.clone(), read_half, pool);
    (tunnel, local)
}
